use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use util::sync::Mutex;

use crate::buffer::Factory;
use crate::config::RouterConfig;
use crate::peer::Peer;
use crate::publisher::Publisher;
use crate::session::Session;
use crate::subscriber::Subscriber;
use crate::track::RtcpWriter;

/// Process-level registry: sessions by id and the shared buffer factory the
/// transport writes decrypted media into.
pub struct Sfu {
    config: RouterConfig,
    factory: Arc<Factory>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl Sfu {
    pub fn new(config: RouterConfig) -> Arc<Self> {
        Arc::new(Sfu {
            config,
            factory: Factory::new(),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// The transport resolves per-SSRC ingest buffers through this.
    pub fn buffer_factory(&self) -> &Arc<Factory> {
        &self.factory
    }

    pub fn get_session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().get(id).cloned()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().values().cloned().collect()
    }

    /// Sessions come to life on first join and unregister themselves when
    /// the last peer leaves; a later lookup starts from scratch.
    pub async fn get_or_create_session(self: &Arc<Self>, id: &str) -> Arc<Session> {
        // Check and insert under one lock acquisition: two racing first
        // joins must end up in the same session.
        let (session, created) = {
            let mut sessions = self.sessions.lock();
            match sessions.entry(id.to_owned()) {
                Entry::Occupied(e) => (Arc::clone(e.get()), false),
                Entry::Vacant(e) => {
                    let session = Session::new(id.to_owned(), &self.config);
                    e.insert(Arc::clone(&session));
                    (session, true)
                }
            }
        };
        if created {
            // The registry entry cannot close before this hook lands: a
            // session only closes when its last peer leaves, and no peer
            // has been added yet.
            let sfu: Weak<Sfu> = Arc::downgrade(self);
            let session_id = id.to_owned();
            session
                .on_close(Box::new(move || {
                    let sfu = sfu.clone();
                    let session_id = session_id.clone();
                    Box::pin(async move {
                        if let Some(sfu) = sfu.upgrade() {
                            sfu.sessions.lock().remove(&session_id);
                        }
                    })
                }))
                .await;
        }
        session
    }

    /// Creates a peer inside a session. The caller installs its transport
    /// hooks on the subscriber and then calls Peer::join to subscribe to the
    /// tracks the session already carries.
    pub async fn create_peer(
        self: &Arc<Self>,
        session_id: &str,
        peer_id: &str,
        publisher_rtcp: Arc<dyn RtcpWriter>,
        subscriber_rtcp: Arc<dyn RtcpWriter>,
        no_auto_subscribe: bool,
    ) -> Arc<Peer> {
        let session = self.get_or_create_session(session_id).await;
        let publisher = Publisher::new(
            peer_id.to_owned(),
            &session,
            Arc::clone(&self.factory),
            self.config.clone(),
            publisher_rtcp,
        );
        let subscriber = Subscriber::new(peer_id.to_owned(), subscriber_rtcp, no_auto_subscribe);
        let peer = Peer::new(peer_id.to_owned(), publisher, subscriber, &session);
        session.add_peer(Arc::clone(&peer));
        peer
    }
}
