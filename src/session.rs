use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use util::sync::Mutex;

use crate::audio_observer::AudioObserver;
use crate::config::RouterConfig;
use crate::peer::Peer;
use crate::router::Router;
use crate::track::receiver::Receiver;

pub type OnCloseHdlrFn = Box<
    dyn (FnMut() -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync + 'static,
>;
pub type OnAudioLevelChangedHdlrFn = Box<
    dyn (FnMut(Vec<String>) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>)
        + Send
        + Sync
        + 'static,
>;

/// A set of peers exchanging media: every publisher's tracks are offered to
/// every other peer's subscriber. Created lazily on first join and closed
/// when the last peer leaves.
pub struct Session {
    id: String,
    closed: AtomicBool,
    peers: Mutex<HashMap<String, Arc<Peer>>>,
    audio_observer: Arc<AudioObserver>,

    on_close_handler: tokio::sync::Mutex<Option<OnCloseHdlrFn>>,
    on_audio_level_handler: Arc<tokio::sync::Mutex<Option<OnAudioLevelChangedHdlrFn>>>,
}

impl Session {
    pub fn new(id: String, config: &RouterConfig) -> Arc<Self> {
        let audio = config.audio_level;
        let session = Arc::new(Session {
            id,
            closed: AtomicBool::new(false),
            peers: Mutex::new(HashMap::new()),
            audio_observer: Arc::new(AudioObserver::new(
                audio.threshold,
                audio.interval,
                audio.filter,
            )),
            on_close_handler: tokio::sync::Mutex::new(None),
            on_audio_level_handler: Arc::new(tokio::sync::Mutex::new(None)),
        });
        session.start_audio_task(audio.interval);
        session
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn audio_observer(&self) -> &Arc<AudioObserver> {
        &self.audio_observer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn on_close(&self, f: OnCloseHdlrFn) {
        *self.on_close_handler.lock().await = Some(f);
    }

    /// Fires whenever the ordered active-speaker list changes.
    pub async fn on_audio_level_changed(&self, f: OnAudioLevelChangedHdlrFn) {
        *self.on_audio_level_handler.lock().await = Some(f);
    }

    pub fn add_peer(&self, peer: Arc<Peer>) {
        self.peers.lock().insert(peer.id().to_owned(), peer);
    }

    pub fn get_peer(&self, id: &str) -> Option<Arc<Peer>> {
        self.peers.lock().get(id).cloned()
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.lock().values().cloned().collect()
    }

    /// Drops a peer; the last one out closes the session.
    pub async fn remove_peer(&self, id: &str) {
        let empty = {
            let mut peers = self.peers.lock();
            peers.remove(id);
            peers.is_empty()
        };
        if empty {
            self.close().await;
        }
    }

    /// Offers a newly created receiver to every other peer in the session.
    pub async fn publish(&self, router: &Arc<Router>, recv: Arc<Receiver>) {
        for peer in self.peers() {
            if peer.id() == router.id() {
                continue;
            }
            if let Err(err) = router
                .add_down_tracks(peer.subscriber(), Some(Arc::clone(&recv)))
                .await
            {
                log::error!("session {}: subscribe {} failed: {}", self.id, peer.id(), err);
            }
        }
    }

    /// Subscribes a joining peer to everything the session already carries.
    pub async fn subscribe(&self, peer: &Arc<Peer>) {
        for other in self.peers() {
            if other.id() == peer.id() {
                continue;
            }
            let router = other.publisher().router();
            if let Err(err) = router.add_down_tracks(peer.subscriber(), None).await {
                log::error!(
                    "session {}: subscribe {} to {} failed: {}",
                    self.id,
                    peer.id(),
                    other.id(),
                    err
                );
            }
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut handler = self.on_close_handler.lock().await;
        if let Some(f) = &mut *handler {
            f().await;
        }
    }

    fn start_audio_task(self: &Arc<Self>, interval_ms: u64) {
        let session = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut last: Vec<String> = Vec::new();
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(100)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(session) = session.upgrade() else { return };
                if session.is_closed() {
                    return;
                }
                let levels = session.audio_observer.calc();
                if levels == last {
                    continue;
                }
                last = levels.clone();
                let mut handler = session.on_audio_level_handler.lock().await;
                if let Some(f) = &mut *handler {
                    f(levels).await;
                }
            }
        });
    }
}
