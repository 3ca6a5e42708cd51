use std::sync::{Arc, Weak};

use crate::buffer::Factory;
use crate::config::RouterConfig;
use crate::router::Router;
use crate::session::Session;
use crate::track::receiver::Receiver;
use crate::track::{RemoteTrack, RtcpWriter};

/// Ingest half of a peer; owns the router that fans its media out.
pub struct Publisher {
    id: String,
    router: Arc<Router>,
    session: Weak<Session>,
}

impl Publisher {
    pub fn new(
        id: String,
        session: &Arc<Session>,
        factory: Arc<Factory>,
        config: RouterConfig,
        rtcp_writer: Arc<dyn RtcpWriter>,
    ) -> Arc<Self> {
        let router = Router::new(
            id.clone(),
            factory,
            config,
            rtcp_writer,
            Arc::clone(session.audio_observer()),
        );
        Arc::new(Publisher {
            id,
            router,
            session: Arc::downgrade(session),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Entry point for a new upstream track announced by the transport.
    /// First sight of a track id fans it out to every peer in the session.
    pub async fn on_track(&self, track: RemoteTrack) -> Arc<Receiver> {
        let (receiver, created) = self.router.add_receiver(track).await;
        if created {
            if let Some(session) = self.session.upgrade() {
                session.publish(&self.router, Arc::clone(&receiver)).await;
            }
        }
        receiver
    }

    pub async fn close(&self) {
        self.router.stop().await;
    }
}
