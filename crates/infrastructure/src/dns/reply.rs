//! Reply construction shared by the request pipeline and the forwarder.

use hickory_proto::op::{Message, MessageType, ResponseCode};

/// A response skeleton mirroring the request: same ID, opcode, RD and
/// question; RA set, AA clear.
pub fn skeleton(request: &Message) -> Message {
    let mut message = Message::new();
    message
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(true)
        .set_authoritative(false);
    message.add_queries(request.queries().iter().cloned());
    message
}

/// An empty reply carrying only an rcode.
pub fn with_rcode(request: &Message, rcode: ResponseCode) -> Message {
    let mut message = skeleton(request);
    message.set_response_code(rcode);
    message
}
