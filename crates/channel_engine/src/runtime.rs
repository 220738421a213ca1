use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::info;

use crate::{engine::ChannelEngine, events::EngineEvent, LiveEventStream};

impl ChannelEngine {
    /// Consumes the transport's live feed on a background task.
    pub fn spawn_live_event_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let events = self.transport.live_events();
        self.spawn_event_loop(events)
    }

    /// Processes `events` strictly in delivery order until the stream ends. A failing
    /// event is logged and published as `EngineEvent::Error`; the loop keeps going.
    pub fn spawn_event_loop(self: &Arc<Self>, mut events: LiveEventStream) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            info!("membership: event loop started");
            while let Some(event) = events.next().await {
                if let Err(err) = engine.handle_live_event(event).await {
                    err.log("membership");
                    let _ = engine.events.send(EngineEvent::Error(err.to_string()));
                }
            }
            info!("membership: event loop stopped");
        })
    }
}
