//! The dedicated receive thread: block on the notifier, and when woken,
//! drain every descriptor chain the avail ring currently holds before
//! going back to sleep. The wake is edge-triggered — a chain left
//! unconsumed here does not get a second wakeup until some unrelated
//! doorbell arrives, so draining fully on every wake is not an
//! optimization, it's required for correctness.

use amp_notify::{Notifier, Wake};
use amp_virtio::Consumer;
use log::{debug, error, warn};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use vm_memory::{Bytes, GuestAddress};

use crate::header;
use crate::ns::{NsMsg, RPMSG_NS_EPT_ADDR};
use crate::registry::Registry;

/// Runs until `notifier` reports `Wake::Cancelled` or an error. `registry` is
/// shared rather than owned so a client can retain its registered services
/// across a stop/start cycle instead of losing them when this thread exits.
pub fn spawn(
    mut consumer: Consumer,
    notifier: Arc<Notifier>,
    registry: Arc<Mutex<Registry>>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match notifier.wait() {
            Ok(Wake::Cancelled) => {
                debug!("rpmsg receive loop: cancelled, exiting");
                return;
            }
            Ok(Wake::Event) => {}
            Err(e) => {
                error!("rpmsg receive loop: notifier wait failed: {e}");
                return;
            }
        }

        loop {
            let (head, chain) = match consumer.pop_avail() {
                Ok(Some(v)) => v,
                Ok(None) => break,
                Err(e) => {
                    error!("rpmsg receive loop: pop_avail failed: {e}");
                    return;
                }
            };

            let mut consumed = 0u32;
            for buf in &chain {
                if buf.writable {
                    continue;
                }
                let mut bytes = vec![0u8; buf.len as usize];
                if let Err(e) = consumer.mem().read_slice(&mut bytes, GuestAddress(buf.addr)) {
                    warn!("rpmsg receive loop: failed to read descriptor: {e}");
                    continue;
                }
                consumed += bytes.len() as u32;
                dispatch(&bytes, &registry);
            }

            if let Err(e) = consumer.add_used(head, consumed) {
                error!("rpmsg receive loop: add_used failed: {e}");
                return;
            }
        }
    })
}

fn dispatch(bytes: &[u8], registry: &Mutex<Registry>) {
    let (h, payload) = match header::decode_frame(bytes) {
        Ok(v) => v,
        Err(e) => {
            warn!("rpmsg receive loop: malformed frame: {e}");
            return;
        }
    };

    let mut registry = registry.lock().expect("registry mutex poisoned");

    if h.dst == RPMSG_NS_EPT_ADDR {
        match NsMsg::decode(payload) {
            Ok(msg) => {
                registry.handle_announce(&msg.name, msg.addr, msg.flags);
            }
            Err(e) => warn!("rpmsg receive loop: malformed name-service message: {e}"),
        }
        return;
    }

    if !registry.dispatch(h.dst, payload) {
        warn!("rpmsg receive loop: no endpoint bound at {:#x}, dropping frame", h.dst);
    }
}
