//! Subcommands. Each one opens its own session from the configuration.

pub mod demo;
pub mod info;
pub mod stress;
pub mod tables;

use anyhow::Context;
use ferry_runtime::{Bridge, BridgeConfig};
use ferry_user::{CanvasClient, CanvasHost, ReferenceUser, UserApiStubs};
use std::sync::Arc;

/// A bridge with the sample surfaces over reference backends.
pub struct Session {
    pub bridge: Arc<Bridge>,
    pub native: Arc<ReferenceUser>,
    pub canvas: Arc<CanvasHost>,
}

impl Session {
    pub fn open(config: &BridgeConfig) -> anyhow::Result<Self> {
        let native = Arc::new(ReferenceUser::new());
        let builder = config
            .bridge_builder()
            .context("selecting the address translator")?;
        let (builder, canvas) = ferry_user::install(builder, Arc::clone(&native));
        let bridge = builder.build().context("building the bridge")?;
        log::debug!("session ready: {:?}", bridge);
        Ok(Self {
            bridge: Arc::new(bridge),
            native,
            canvas,
        })
    }

    pub fn user(&self) -> UserApiStubs<Arc<Bridge>> {
        UserApiStubs::new(Arc::clone(&self.bridge))
    }

    pub fn canvases(&self) -> CanvasClient {
        CanvasClient::new(self.bridge.clone(), Arc::clone(self.bridge.memory()))
    }
}
