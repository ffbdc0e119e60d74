//! Thin traits over `TcpListener`/`TcpStream` so the accept loop and
//! connection FSM can be exercised against an in-memory double in tests
//! without binding a real socket.

pub mod tcp_listener;
pub mod tcp_stream;
