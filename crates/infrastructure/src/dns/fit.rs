//! Shrinks a response until it fits the transport.
//!
//! Sections go in order of expendability: additionals (with the OPT
//! record), then authority, then answers. Over UDP a reply that had to be
//! trimmed carries TC so the client can retry over TCP; over TCP nothing
//! larger than the frame format allows can be salvaged and the caller
//! answers SERVFAIL instead.

use hickory_proto::op::Message;

/// Makes `message` fit in `size` bytes on the wire. Returns true when even
/// an empty TCP reply would not fit, in which case the caller must replace
/// the reply entirely.
pub fn fit(message: &mut Message, size: usize, tcp: bool) -> bool {
    if wire_len(message) <= size {
        return false;
    }

    message.take_additionals();
    *message.extensions_mut() = None;
    if wire_len(message) <= size {
        return false;
    }

    if !tcp {
        message.set_truncated(true);
    }

    while wire_len(message) > size && !message.name_servers().is_empty() {
        message.name_servers_mut().pop();
    }
    while wire_len(message) > size && !message.answers().is_empty() {
        message.answers_mut().pop();
    }

    if wire_len(message) > size {
        if tcp {
            return true;
        }
        message.take_answers();
        message.take_name_servers();
        message.set_truncated(true);
    }
    false
}

fn wire_len(message: &Message) -> usize {
    message
        .to_vec()
        .map(|bytes| bytes.len())
        .unwrap_or(usize::MAX)
}
