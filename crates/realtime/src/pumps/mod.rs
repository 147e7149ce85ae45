//! Socket pumps. One task drains the socket into channel events, the other
//! serialises outbound frames onto the socket.

pub(crate) mod read;
pub(crate) mod write;
