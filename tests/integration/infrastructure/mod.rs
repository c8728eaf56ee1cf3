pub mod process_harness;
pub mod socket_framework;

pub use process_harness::{loopback_repeater, HarnessRunner, TestProcess};
pub use socket_framework::SocketTestUtils;
