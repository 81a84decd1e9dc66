//! Handle-based session registry for host applications.
//!
//! Sessions live in an arena of slots. A [`SessionHandle`] packs the slot
//! index with the slot's generation, so a handle that outlived its session
//! (or was never issued) is rejected with [`InferenceError::InvalidSession`]
//! instead of reaching freed memory. Models are cached by path and shared by
//! every session opened on the same file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError, Weak};

use tracing::{debug, info, warn};

use crate::backend::{ContextParams, EngineLoader};
use crate::chat::{HistoryEntry, Message};
use crate::config::{SamplingParams, SessionConfig};
use crate::engine::{GenerationOutput, TokenSink};
use crate::error::InferenceError;

use super::Session;

/// Opaque reference to a session. `0` is the null handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SessionHandle(u64);

impl SessionHandle {
    pub const NULL: SessionHandle = SessionHandle(0);

    fn new(index: u32, generation: u32) -> Self {
        debug_assert!(generation != 0);
        SessionHandle(((generation as u64) << 32) | index as u64)
    }

    pub fn from_raw(raw: u64) -> Self {
        SessionHandle(raw)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    fn index(&self) -> usize {
        (self.0 & 0xffff_ffff) as usize
    }

    fn generation(&self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl std::fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

type SharedSession<L> =
    Arc<Mutex<Session<<L as EngineLoader>::Model, <L as EngineLoader>::Context>>>;

struct Slot<L: EngineLoader> {
    generation: u32,
    session: Option<SharedSession<L>>,
}

struct Arena<L: EngineLoader> {
    slots: Vec<Slot<L>>,
    free: Vec<u32>,
}

impl<L: EngineLoader> Arena<L> {
    fn insert(&mut self, session: SharedSession<L>) -> Result<SessionHandle, InferenceError> {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.session = Some(session);
            return Ok(SessionHandle::new(index, slot.generation));
        }
        let index = u32::try_from(self.slots.len())
            .map_err(|_| InferenceError::Initialization("too many open sessions".to_string()))?;
        self.slots.push(Slot {
            generation: 1,
            session: Some(session),
        });
        Ok(SessionHandle::new(index, 1))
    }

    fn get(&self, handle: SessionHandle) -> Option<&SharedSession<L>> {
        if handle.is_null() {
            return None;
        }
        self.slots
            .get(handle.index())
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.session.as_ref())
    }

    fn remove(&mut self, handle: SessionHandle) -> Option<SharedSession<L>> {
        self.get(handle)?;
        let index = handle.index();
        let slot = &mut self.slots[index];
        let session = slot.session.take();
        slot.generation = match slot.generation.wrapping_add(1) {
            0 => 1,
            g => g,
        };
        self.free.push(index as u32);
        session
    }
}

/// Owns every open session and the models they share.
pub struct SessionRegistry<L: EngineLoader> {
    loader: L,
    arena: Mutex<Arena<L>>,
    models: Mutex<HashMap<PathBuf, Weak<L::Model>>>,
}

impl<L: EngineLoader> SessionRegistry<L> {
    pub fn new(loader: L) -> Self {
        Self {
            loader,
            arena: Mutex::new(Arena {
                slots: Vec::new(),
                free: Vec::new(),
            }),
            models: Mutex::new(HashMap::new()),
        }
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    /// Open a session with default configuration and the given sampling
    /// parameters.
    pub fn init(
        &self,
        model_path: impl AsRef<Path>,
        sampling: SamplingParams,
    ) -> Result<SessionHandle, InferenceError> {
        let config = SessionConfig {
            sampling,
            ..Default::default()
        };
        self.init_with_config(model_path, config)
    }

    /// Load (or reuse) the model at `model_path` and open a session on it.
    ///
    /// Nothing is registered unless every step succeeds; a partially built
    /// session is dropped on the error path.
    pub fn init_with_config(
        &self,
        model_path: impl AsRef<Path>,
        config: SessionConfig,
    ) -> Result<SessionHandle, InferenceError> {
        let path = model_path.as_ref();
        config.validate()?;

        let model = self.model_for(path)?;
        let params = ContextParams {
            context_size: config.context_size,
            batch_size: config.effective_batch_size(),
            threads: config.threads,
        };
        let ctx = self.loader.new_context(&model, &params)?;
        let session = Session::new(model, ctx, config);

        let handle = lock(&self.arena).insert(Arc::new(Mutex::new(session)))?;
        info!(
            handle = %handle,
            path = %path.display(),
            context_size = params.context_size,
            threads = params.threads,
            "Session initialized"
        );
        Ok(handle)
    }

    /// Run one blocking turn and return the reply text.
    pub fn predict(&self, handle: SessionHandle, prompt: &str) -> Result<String, InferenceError> {
        let session = self.session(handle)?;
        let mut session = try_lock(&session)?;
        session.predict(prompt).map(|output| output.text)
    }

    /// Run one streaming turn.
    ///
    /// The sink gets zero or more `on_token` calls followed by exactly one
    /// `on_complete` or `on_error`, including when the handle is invalid.
    pub fn predict_streaming<S: TokenSink + ?Sized>(
        &self,
        handle: SessionHandle,
        prompt: &str,
        params: &SamplingParams,
        sink: &mut S,
    ) -> Result<GenerationOutput, InferenceError> {
        let session = match self.session(handle) {
            Ok(session) => session,
            Err(e) => {
                sink.on_error(&e.to_string());
                return Err(e);
            }
        };
        let mut session = match try_lock(&session) {
            Ok(session) => session,
            Err(e) => {
                sink.on_error(&e.to_string());
                return Err(e);
            }
        };
        session.predict_streaming(prompt, params, sink)
    }

    /// Replace a session's conversation with saved messages.
    pub fn restore_history(
        &self,
        handle: SessionHandle,
        entries: &[HistoryEntry],
    ) -> Result<(), InferenceError> {
        let session = self.session(handle)?;
        let mut session = try_lock(&session)?;
        session.restore_history(entries);
        Ok(())
    }

    /// A copy of the session's conversation.
    pub fn history(&self, handle: SessionHandle) -> Result<Vec<Message>, InferenceError> {
        let session = self.session(handle)?;
        let session = try_lock(&session)?;
        Ok(session.history().messages().to_vec())
    }

    /// Release a session. Null, unknown and already freed handles are ignored.
    ///
    /// Returns whether a session was released. A turn still running on the
    /// session finishes before its resources are dropped.
    pub fn free(&self, handle: SessionHandle) -> bool {
        let removed = lock(&self.arena).remove(handle);
        match removed {
            Some(session) => {
                drop(session);
                self.prune_models();
                info!(handle = %handle, "Session freed");
                true
            }
            None => {
                debug!(handle = %handle, "Ignoring free of unknown session handle");
                false
            }
        }
    }

    /// Number of open sessions.
    pub fn len(&self) -> usize {
        lock(&self.arena)
            .slots
            .iter()
            .filter(|slot| slot.session.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of distinct models currently loaded.
    pub fn loaded_models(&self) -> usize {
        lock(&self.models)
            .values()
            .filter(|model| model.strong_count() > 0)
            .count()
    }

    fn session(&self, handle: SessionHandle) -> Result<SharedSession<L>, InferenceError> {
        lock(&self.arena)
            .get(handle)
            .cloned()
            .ok_or(InferenceError::InvalidSession)
    }

    fn model_for(&self, path: &Path) -> Result<Arc<L::Model>, InferenceError> {
        let mut models = lock(&self.models);
        if let Some(model) = models.get(path).and_then(Weak::upgrade) {
            debug!(path = %path.display(), "Reusing loaded model");
            return Ok(model);
        }

        info!(path = %path.display(), "Loading model");
        let model = Arc::new(self.loader.load_model(path)?);
        models.retain(|_, weak| weak.strong_count() > 0);
        models.insert(path.to_path_buf(), Arc::downgrade(&model));
        Ok(model)
    }

    fn prune_models(&self) {
        lock(&self.models).retain(|path, weak| {
            let live = weak.strong_count() > 0;
            if !live {
                debug!(path = %path.display(), "Model released");
            }
            live
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn try_lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, InferenceError> {
    match mutex.try_lock() {
        Ok(guard) => Ok(guard),
        Err(TryLockError::WouldBlock) => Err(InferenceError::SessionBusy),
        Err(TryLockError::Poisoned(poisoned)) => {
            warn!("Session lock poisoned by an earlier panic; continuing");
            Ok(poisoned.into_inner())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockLoader;
    use std::sync::atomic::Ordering;

    fn registry() -> SessionRegistry<MockLoader> {
        SessionRegistry::new(MockLoader::default())
    }

    #[test]
    fn test_handle_packing() {
        let handle = SessionHandle::new(5, 3);
        assert_eq!(handle.index(), 5);
        assert_eq!(handle.generation(), 3);
        assert!(!handle.is_null());
        assert_eq!(SessionHandle::from_raw(handle.as_raw()), handle);
        assert!(SessionHandle::NULL.is_null());
        assert_eq!(SessionHandle::default(), SessionHandle::NULL);
        // index 0, generation 1 must still be non-null
        assert!(!SessionHandle::new(0, 1).is_null());
    }

    #[test]
    fn test_init_predict_free_lifecycle() {
        let reg = registry();
        let handle = reg.init("model.gguf", SamplingParams::default()).unwrap();
        assert_eq!(reg.len(), 1);

        let reply = reg.predict(handle, "Hi").unwrap();
        assert!(!reply.is_empty());
        assert_eq!(reg.history(handle).unwrap().len(), 2);

        assert!(reg.free(handle));
        assert!(reg.is_empty());
        assert!(matches!(
            reg.predict(handle, "Hi"),
            Err(InferenceError::InvalidSession)
        ));
        assert_eq!(reg.loaded_models(), 0);
    }

    #[test]
    fn test_free_is_idempotent() {
        let reg = registry();
        let handle = reg.init("model.gguf", SamplingParams::default()).unwrap();
        assert!(reg.free(handle));
        assert!(!reg.free(handle));
        assert!(!reg.free(SessionHandle::NULL));
        assert!(!reg.free(SessionHandle::from_raw(0xdead_beef_0000_0007)));
    }

    #[test]
    fn test_null_and_stale_handles_rejected() {
        let reg = registry();
        assert!(matches!(
            reg.predict(SessionHandle::NULL, "Hi"),
            Err(InferenceError::InvalidSession)
        ));

        let old = reg.init("model.gguf", SamplingParams::default()).unwrap();
        reg.free(old);
        // the slot is reused with a new generation
        let new = reg.init("model.gguf", SamplingParams::default()).unwrap();
        assert_ne!(old, new);
        assert!(matches!(
            reg.restore_history(old, &[]),
            Err(InferenceError::InvalidSession)
        ));
        assert!(reg.restore_history(new, &[]).is_ok());
    }

    #[test]
    fn test_sessions_share_loaded_model() {
        let reg = registry();
        let a = reg.init("model.gguf", SamplingParams::default()).unwrap();
        let b = reg.init("model.gguf", SamplingParams::default()).unwrap();
        let c = reg.init("other.gguf", SamplingParams::default()).unwrap();
        assert_eq!(reg.loader().loads.load(Ordering::SeqCst), 2);
        assert_eq!(reg.loaded_models(), 2);

        reg.free(a);
        assert_eq!(reg.loaded_models(), 2);
        reg.free(b);
        assert_eq!(reg.loaded_models(), 1);
        reg.free(c);
        assert_eq!(reg.loaded_models(), 0);

        // reloading after release goes back to the loader
        let d = reg.init("model.gguf", SamplingParams::default()).unwrap();
        assert_eq!(reg.loader().loads.load(Ordering::SeqCst), 3);
        reg.free(d);
    }

    #[test]
    fn test_init_failure_registers_nothing() {
        let reg = registry();
        let err = reg
            .init("missing.gguf", SamplingParams::default())
            .unwrap_err();
        assert!(matches!(err, InferenceError::Initialization(_)));
        assert!(reg.is_empty());
        assert_eq!(reg.loaded_models(), 0);

        let bad_config = SessionConfig {
            context_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            reg.init_with_config("model.gguf", bad_config),
            Err(InferenceError::Config(_))
        ));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_restore_history_then_predict() {
        let reg = registry();
        let handle = reg.init("model.gguf", SamplingParams::default()).unwrap();
        reg.restore_history(
            handle,
            &[
                HistoryEntry::new("USER", "Hello"),
                HistoryEntry::new("BOT", "Hi there"),
            ],
        )
        .unwrap();
        reg.predict(handle, "What's up?").unwrap();

        let history = reg.history(handle).unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0], Message::user("Hello"));
        assert_eq!(history[1], Message::assistant("Hi there"));
        assert_eq!(history[2], Message::user("What's up?"));
    }

    #[test]
    fn test_streaming_invalid_handle_reports_error_once() {
        let reg = registry();
        let mut errors = Vec::new();
        struct ErrorSink<'a>(&'a mut Vec<String>);
        impl TokenSink for ErrorSink<'_> {
            fn on_token(&mut self, _fragment: &str) {
                panic!("no tokens expected");
            }
            fn on_complete(&mut self, _tps: f64, _secs: f64) {
                panic!("no completion expected");
            }
            fn on_error(&mut self, message: &str) {
                self.0.push(message.to_string());
            }
        }

        let result = reg.predict_streaming(
            SessionHandle::NULL,
            "Hi",
            &SamplingParams::default(),
            &mut ErrorSink(&mut errors),
        );
        assert!(matches!(result, Err(InferenceError::InvalidSession)));
        assert_eq!(errors, vec!["Invalid session handle".to_string()]);
    }

    #[test]
    fn test_streaming_fragments_match_history() {
        let reg = registry();
        let handle = reg.init("model.gguf", SamplingParams::greedy()).unwrap();
        let mut streamed = String::new();
        let mut sink = |fragment: &str| streamed.push_str(fragment);

        let out = reg
            .predict_streaming(handle, "Hi", &SamplingParams::greedy(), &mut sink)
            .unwrap();
        assert_eq!(streamed, out.text);
        assert_eq!(reg.history(handle).unwrap()[1].content(), streamed);
    }

    #[test]
    fn test_busy_session_is_reported() {
        let reg = registry();
        let handle = reg.init("model.gguf", SamplingParams::default()).unwrap();
        let session = reg.session(handle).unwrap();
        let _guard = session.lock().unwrap();

        assert!(matches!(
            reg.predict(handle, "Hi"),
            Err(InferenceError::SessionBusy)
        ));
    }

    #[test]
    fn test_registry_is_shareable_across_threads() {
        let reg = Arc::new(registry());
        let workers: Vec<_> = (0..4)
            .map(|i| {
                let reg = Arc::clone(&reg);
                std::thread::spawn(move || {
                    let handle = reg.init("model.gguf", SamplingParams::default()).unwrap();
                    reg.predict(handle, &format!("hello {}", i)).unwrap();
                    reg.free(handle)
                })
            })
            .collect();
        for worker in workers {
            assert!(worker.join().unwrap());
        }
        assert!(reg.is_empty());
        assert_eq!(reg.loaded_models(), 0);
    }
}
