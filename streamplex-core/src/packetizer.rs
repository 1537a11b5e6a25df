//! Packetizer core: one controller, one transport endpoint, N channel endpoints
//!
//! ```text
//!  user --> Application[i] --> Controller --> Transport.master --> link
//!  user <-- Application[i] <-- Controller <-- Transport        <-- link
//! ```

use crate::adapter::{Application, Transport};
use crate::config::PacketizerConfig;
use crate::controller::{Controller, StatsSnapshot};
use crate::error::StreamError;
use crate::stream::Master;
use crate::Result;
use std::sync::Arc;

#[cfg(feature = "logging")]
use tracing::info;

/// Composition root of a packetized link
///
/// Endpoints are handed out as `Arc`s; they stay usable after the core is
/// dropped but fail with `TransportClosed` once it is closed.
pub struct Core {
    controller: Arc<Controller>,
    transport: Arc<Transport>,
    applications: Vec<Arc<Application>>,
}

impl Core {
    /// Build a core and wire its endpoints to a new controller
    pub fn new(config: PacketizerConfig) -> Result<Self> {
        config.validate()?;
        let transport_master = Arc::new(Master::new());
        let app_masters: Vec<Arc<Master>> = (0..config.channels)
            .map(|_| Arc::new(Master::new()))
            .collect();

        let controller = Arc::new(Controller::new(
            config,
            transport_master.clone(),
            app_masters.clone(),
        )?);
        let transport = Arc::new(Transport::new(controller.clone(), transport_master));
        let applications = app_masters
            .into_iter()
            .enumerate()
            .map(|(channel, master)| {
                Arc::new(Application::new(channel as u8, controller.clone(), master))
            })
            .collect();

        Ok(Self {
            controller,
            transport,
            applications,
        })
    }

    /// Link-side endpoint
    pub fn transport(&self) -> Arc<Transport> {
        self.transport.clone()
    }

    /// Endpoint of `channel`
    pub fn application(&self, channel: u8) -> Result<Arc<Application>> {
        self.applications
            .get(channel as usize)
            .cloned()
            .ok_or(StreamError::InvalidChannel(channel))
    }

    /// Every channel endpoint, in channel order
    pub fn applications(&self) -> &[Arc<Application>] {
        &self.applications
    }

    /// The protocol engine
    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    /// Protocol counters
    pub fn stats(&self) -> StatsSnapshot {
        self.controller.stats().snapshot()
    }

    /// Stop the core and detach every slave
    ///
    /// Blocked buffer requests fail with `TransportClosed`. Detaching breaks
    /// the reference cycles a back-to-back link creates.
    pub fn close(&self) {
        if self.controller.is_closed() {
            return;
        }
        self.controller.close();
        self.transport.master().clear_slaves();
        for app in &self.applications {
            app.master().clear_slaves();
        }

        #[cfg(feature = "logging")]
        info!("Packetizer core closed");
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        self.close();
    }
}

/// Wire two cores' transports to each other, as over a perfect link
pub fn connect(a: &Core, b: &Core) {
    a.transport.set_slave(b.transport.clone());
    b.transport.set_slave(a.transport.clone());
}
