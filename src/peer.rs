use std::sync::{Arc, Weak};

use crate::publisher::Publisher;
use crate::session::Session;
use crate::subscriber::Subscriber;

/// One connected client: a publisher role and a subscriber role, owned by
/// exactly one session for the lifetime of its transport.
pub struct Peer {
    id: String,
    publisher: Arc<Publisher>,
    subscriber: Arc<Subscriber>,
    session: Weak<Session>,
}

impl Peer {
    pub(crate) fn new(
        id: String,
        publisher: Arc<Publisher>,
        subscriber: Arc<Subscriber>,
        session: &Arc<Session>,
    ) -> Arc<Self> {
        Arc::new(Peer {
            id,
            publisher,
            subscriber,
            session: Arc::downgrade(session),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn publisher(&self) -> &Arc<Publisher> {
        &self.publisher
    }

    pub fn subscriber(&self) -> &Arc<Subscriber> {
        &self.subscriber
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.upgrade()
    }

    /// Subscribes this peer to every track the session already carries.
    /// Called once the transport has installed its subscriber hooks.
    pub async fn join(self: &Arc<Self>) {
        if let Some(session) = self.session.upgrade() {
            session.subscribe(self).await;
        }
    }

    /// Tears the peer down: its published tracks disappear from every other
    /// peer, its own down tracks close, and it leaves the session.
    pub async fn close(&self) {
        self.publisher.close().await;
        self.subscriber.close().await;
        if let Some(session) = self.session.upgrade() {
            session.remove_peer(&self.id).await;
        }
    }
}
