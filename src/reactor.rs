//! Reactor driver
//!
//! Runs the engine's event loop on a dedicated worker thread, one per open
//! connection. The orchestrator's capacity-1 semaphore serializes reactors:
//! the caller acquires (and forgets) the permit before spawning, and the
//! thread restores it when the run ends, normally or by panic, so a second
//! open attempt stalls until the previous reactor has fully terminated and
//! the gate can never leak.

use std::sync::Arc;

use tracing::{debug, info_span};

use crate::connection::ConnectionShared;
use crate::engine::Engine;
use crate::handler::EventHandler;

struct GateGuard(Arc<ConnectionShared>);

impl Drop for GateGuard {
    fn drop(&mut self) {
        // Runs on every exit path, panic included: close out the connection
        // state, then hand the gate back
        self.0.on_reactor_exit();
        self.0.gate.add_permits(1);
    }
}

/// Spawn the reactor thread for `engine`
///
/// The caller must already hold (and have forgotten) the gate permit.
pub(crate) fn spawn(shared: Arc<ConnectionShared>, engine: Box<dyn Engine>, mut handler: EventHandler) {
    let guard = GateGuard(shared.clone());
    let device = shared.config.device_id.clone();
    std::thread::Builder::new()
        .name("amqp-reactor".into())
        .spawn(move || {
            let _guard = guard;
            let span = info_span!("reactor", device = %device);
            let _enter = span.entered();
            debug!("reactor running");
            engine.run(&mut |ops, event| handler.handle(ops, event));
            debug!("engine run returned");
        })
        .expect("failed to spawn reactor thread");
}
