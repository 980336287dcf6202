//! rpmsg framing, name-service announcements, the endpoint/service
//! registry, and the dedicated receive-loop thread that ties them to a
//! virtqueue consumer.

pub mod header;
pub mod ns;
pub mod recvloop;
pub mod registry;
pub mod sender;

pub use header::{Header, HEADER_SIZE};
pub use ns::{NsFlags, NsMsg, RPMSG_ADDR_ANY, RPMSG_NS_EPT_ADDR};
pub use registry::{BoundEndpoint, Registry, Service};
pub use recvloop::spawn as spawn_recv_loop;
pub use sender::{EndpointSender, VqSender};
