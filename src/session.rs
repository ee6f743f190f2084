//! Host render loop: media lifecycle, parameter publication and pacing.
//!
//! ```text
//! NoMedia -> MediaLoading -> TextureReady -> Rendering
//!                 |                             ^   |
//!                 +-- load failure: prior state  +---+ params / new frame
//! any -> Unsupported (backend init failed, terminal)
//! ```

use std::path::Path;
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::HalftoneError;
use crate::params::HalftoneParameters;
use crate::target::{RenderTarget, RenderedFrame};
use crate::texture::{Texture, DEFAULT_MAX_EDGE};

/// Something that owns a bound source texture and can run the halftone
/// kernel over it.
pub trait RenderBackend {
    fn name(&self) -> &'static str;

    /// Bind `texture` as the source for subsequent renders.
    fn upload(&mut self, texture: &Texture) -> Result<(), HalftoneError>;

    /// Drop the bound texture and any resources sized for it.
    fn release(&mut self);

    fn render(
        &mut self,
        params: &HalftoneParameters,
        target: RenderTarget,
    ) -> Result<RenderedFrame, HalftoneError>;
}

impl<B: RenderBackend + ?Sized> RenderBackend for Box<B> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn upload(&mut self, texture: &Texture) -> Result<(), HalftoneError> {
        (**self).upload(texture)
    }

    fn release(&mut self) {
        (**self).release()
    }

    fn render(
        &mut self,
        params: &HalftoneParameters,
        target: RenderTarget,
    ) -> Result<RenderedFrame, HalftoneError> {
        (**self).render(params, target)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NoMedia,
    MediaLoading,
    TextureReady,
    Rendering,
    Unsupported,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::NoMedia => "no media",
            SessionState::MediaLoading => "loading media",
            SessionState::TextureReady => "texture ready",
            SessionState::Rendering => "rendering",
            SessionState::Unsupported => "unsupported",
        }
    }
}

/// The current parameter snapshot, shared between whoever edits parameters
/// and the loop that renders with them.
///
/// Every edit bumps a generation counter. Readers always take the whole
/// snapshot under one lock, so a render never mixes two updates.
#[derive(Debug, Clone, Default)]
pub struct ParamCell {
    inner: Arc<Mutex<Published>>,
}

#[derive(Debug, Default)]
struct Published {
    params: HalftoneParameters,
    generation: u64,
}

impl ParamCell {
    pub fn new(params: HalftoneParameters) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Published {
                params,
                generation: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Published> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> (HalftoneParameters, u64) {
        let published = self.lock();
        (published.params, published.generation)
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn replace(&self, params: HalftoneParameters) -> u64 {
        self.update(|current| *current = params)
    }

    /// Edit in place; returns the new generation.
    pub fn update(&self, edit: impl FnOnce(&mut HalftoneParameters)) -> u64 {
        let mut published = self.lock();
        edit(&mut published.params);
        published.generation += 1;
        published.generation
    }

    /// Set one named value. A rejected value leaves the snapshot untouched.
    pub fn set_named(&self, name: &str, raw: &str) -> Result<u64, HalftoneError> {
        let mut published = self.lock();
        let mut next = published.params;
        next.set_named(name, raw)?;
        published.params = next;
        published.generation += 1;
        Ok(published.generation)
    }
}

/// Coalesces bursts of changes into one action after a quiet period.
#[derive(Debug, Clone)]
pub struct Debouncer {
    delay: Duration,
    pending_since: Option<Instant>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending_since: None,
        }
    }

    /// Record a change at `now`, restarting the quiet period.
    pub fn poke(&mut self, now: Instant) {
        self.pending_since = Some(now);
    }

    pub fn is_pending(&self) -> bool {
        self.pending_since.is_some()
    }

    /// True once per burst, after `delay` has passed since the last poke.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.pending_since {
            Some(since) if now.saturating_duration_since(since) >= self.delay => {
                self.pending_since = None;
                true
            }
            _ => false,
        }
    }

    /// Time left before a pending burst fires.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.pending_since
            .map(|since| self.delay.saturating_sub(now.saturating_duration_since(since)))
    }
}

/// Latest-wins view over a frame channel: polling returns only the newest
/// queued item and counts the rest as dropped.
#[derive(Debug)]
pub struct LatestFrame<T> {
    rx: Receiver<T>,
    dropped: u64,
    closed: bool,
}

impl<T> LatestFrame<T> {
    pub fn new(rx: Receiver<T>) -> Self {
        Self {
            rx,
            dropped: 0,
            closed: false,
        }
    }

    pub fn poll(&mut self) -> Option<T> {
        let mut latest = None;
        loop {
            match self.rx.try_recv() {
                Ok(item) => {
                    if latest.replace(item).is_some() {
                        self.dropped += 1;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.closed = true;
                    break;
                }
            }
        }
        latest
    }

    /// Blocking wait for the next item in order, dropping nothing.
    pub fn recv(&mut self) -> Option<T> {
        match self.rx.recv() {
            Ok(item) => Some(item),
            Err(_) => {
                self.closed = true;
                None
            }
        }
    }

    /// Blocking wait for the next item, then drain anything newer.
    pub fn wait(&mut self) -> Option<T> {
        match self.rx.recv() {
            Ok(first) => Some(self.poll().map_or(first, |newer| {
                self.dropped += 1;
                newer
            })),
            Err(_) => {
                self.closed = true;
                None
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// The sender hung up and nothing is left to read.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Owns one backend, the bound texture and the render state machine.
pub struct RenderSession<B: RenderBackend> {
    backend: Option<B>,
    state: SessionState,
    params: ParamCell,
    texture: Option<Texture>,
    max_edge: u32,
    viewport: Option<((u32, u32), f32)>,
    rendered_generation: Option<u64>,
    failure: Option<String>,
}

impl<B: RenderBackend> RenderSession<B> {
    pub fn new(backend: B) -> Self {
        Self::initialize(Ok(backend))
    }

    /// Start a session from a backend constructor result. A failed
    /// initialization yields a session stuck in `Unsupported`.
    pub fn initialize(backend: Result<B, HalftoneError>) -> Self {
        let (backend, state, failure) = match backend {
            Ok(backend) => {
                info!(backend = backend.name(), "render session ready");
                (Some(backend), SessionState::NoMedia, None)
            }
            Err(err) => {
                warn!(code = err.code(), error = %err, "render backend unavailable");
                (None, SessionState::Unsupported, Some(err.to_string()))
            }
        };
        Self {
            backend,
            state,
            params: ParamCell::default(),
            texture: None,
            max_edge: DEFAULT_MAX_EDGE,
            viewport: None,
            rendered_generation: None,
            failure,
        }
    }

    pub fn with_params(self, params: HalftoneParameters) -> Self {
        self.params.replace(params);
        self
    }

    pub fn with_max_edge(mut self, max_edge: u32) -> Self {
        self.max_edge = max_edge;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Why the session is `Unsupported`, if it is.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Handle for publishing parameters from elsewhere (watchers, UI threads).
    pub fn params(&self) -> &ParamCell {
        &self.params
    }

    pub fn texture(&self) -> Option<&Texture> {
        self.texture.as_ref()
    }

    pub fn set_param(&mut self, name: &str, raw: &str) -> Result<(), HalftoneError> {
        self.params.set_named(name, raw).map(|_| ())
    }

    pub fn set_params(&mut self, params: HalftoneParameters) {
        self.params.replace(params);
    }

    /// Letterbox output into a container (layout units) at a display
    /// density. Without a viewport the output matches the texture size.
    pub fn set_viewport(&mut self, container: (u32, u32), pixel_ratio: f32) {
        self.viewport = Some((container, pixel_ratio));
        self.rendered_generation = None;
    }

    pub fn target(&self) -> Option<RenderTarget> {
        let texture = self.texture.as_ref()?;
        Some(match self.viewport {
            Some((container, ratio)) => RenderTarget::fit(texture.dimensions(), container, ratio),
            None => RenderTarget::for_texture(texture),
        })
    }

    fn require_backend(&self, action: &'static str) -> Result<(), HalftoneError> {
        if self.state == SessionState::Unsupported || self.backend.is_none() {
            return Err(HalftoneError::InvalidState {
                action,
                state: SessionState::Unsupported.as_str(),
            });
        }
        Ok(())
    }

    /// Decode an image file and bind it. On failure the session keeps
    /// whatever it had before.
    pub fn load_path(&mut self, path: &Path) -> Result<(), HalftoneError> {
        self.require_backend("load media")?;
        let max_edge = self.max_edge;
        self.load_with(|| Texture::load(path, max_edge))
    }

    /// Bind raw RGBA bytes handed over by a host document.
    pub fn load_rgba(&mut self, width: u32, height: u32, rgba: Vec<u8>) -> Result<(), HalftoneError> {
        self.require_backend("load media")?;
        let max_edge = self.max_edge;
        self.load_with(|| Texture::from_rgba8(width, height, rgba).map(|t| t.capped(max_edge)))
    }

    fn load_with(
        &mut self,
        decode: impl FnOnce() -> Result<Texture, HalftoneError>,
    ) -> Result<(), HalftoneError> {
        let prior = self.state;
        self.state = SessionState::MediaLoading;
        match decode() {
            Ok(texture) => self.bind_texture(texture),
            Err(err) => {
                warn!(code = err.code(), error = %err, "media load failed");
                self.state = prior;
                Err(err)
            }
        }
    }

    /// Replace the source texture (a new still, or the next video frame).
    /// The previous texture is released before the new one is bound.
    pub fn bind_texture(&mut self, texture: Texture) -> Result<(), HalftoneError> {
        self.require_backend("bind texture")?;
        let Some(backend) = self.backend.as_mut() else {
            return Err(HalftoneError::InvalidState {
                action: "bind texture",
                state: SessionState::Unsupported.as_str(),
            });
        };
        if self.texture.take().is_some() {
            backend.release();
        }
        self.rendered_generation = None;

        match backend.upload(&texture) {
            Ok(()) => {
                debug!(
                    width = texture.width(),
                    height = texture.height(),
                    "texture bound"
                );
                self.texture = Some(texture);
                self.state = SessionState::TextureReady;
                Ok(())
            }
            Err(err) if err.is_recoverable() => {
                warn!(code = err.code(), error = %err, "texture upload rejected");
                self.state = SessionState::NoMedia;
                Err(err)
            }
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        }
    }

    /// Drop the current media and return to `NoMedia`.
    pub fn unload(&mut self) {
        if self.state == SessionState::Unsupported {
            return;
        }
        if let Some(backend) = self.backend.as_mut() {
            if self.texture.take().is_some() {
                backend.release();
            }
        }
        self.rendered_generation = None;
        self.state = SessionState::NoMedia;
    }

    /// Render with the current parameter snapshot.
    pub fn render(&mut self) -> Result<RenderedFrame, HalftoneError> {
        self.require_backend("render")?;
        if !matches!(
            self.state,
            SessionState::TextureReady | SessionState::Rendering
        ) {
            return Err(HalftoneError::InvalidState {
                action: "render",
                state: self.state.as_str(),
            });
        }
        let target = self.target().ok_or(HalftoneError::InvalidState {
            action: "render",
            state: SessionState::NoMedia.as_str(),
        })?;
        let (params, generation) = self.params.snapshot();
        let Some(backend) = self.backend.as_mut() else {
            return Err(HalftoneError::InvalidState {
                action: "render",
                state: SessionState::Unsupported.as_str(),
            });
        };

        self.state = SessionState::Rendering;
        match backend.render(&params, target) {
            Ok(frame) => {
                self.rendered_generation = Some(generation);
                Ok(frame)
            }
            Err(err) if err.is_recoverable() => Err(err),
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        }
    }

    /// Render only if parameters or media changed since the last render.
    pub fn render_if_dirty(&mut self) -> Result<Option<RenderedFrame>, HalftoneError> {
        if self.rendered_generation == Some(self.params.generation())
            && self.state == SessionState::Rendering
        {
            return Ok(None);
        }
        self.render().map(Some)
    }

    fn fail(&mut self, err: &HalftoneError) {
        warn!(code = err.code(), error = %err, "render session is now unsupported");
        if let Some(mut backend) = self.backend.take() {
            backend.release();
        }
        self.texture = None;
        self.state = SessionState::Unsupported;
        self.failure = Some(err.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::software::SoftwareRenderer;
    use std::sync::mpsc;

    #[derive(Default)]
    struct Counting {
        uploads: usize,
        releases: usize,
        bound: bool,
        fail_next_upload: Option<HalftoneError>,
    }

    impl RenderBackend for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn upload(&mut self, _texture: &Texture) -> Result<(), HalftoneError> {
            if let Some(err) = self.fail_next_upload.take() {
                return Err(err);
            }
            self.uploads += 1;
            self.bound = true;
            Ok(())
        }

        fn release(&mut self) {
            self.releases += 1;
            self.bound = false;
        }

        fn render(
            &mut self,
            _params: &HalftoneParameters,
            target: RenderTarget,
        ) -> Result<RenderedFrame, HalftoneError> {
            assert!(self.bound, "render without a bound texture");
            Ok(RenderedFrame {
                width: target.width,
                height: target.height,
                rgba: vec![255; target.byte_len().expect("small target")],
            })
        }
    }

    fn texture() -> Texture {
        Texture::solid(8, 4, [128, 128, 128, 255]).expect("solid texture")
    }

    #[test]
    fn walks_the_happy_path() {
        let mut session = RenderSession::new(SoftwareRenderer::new());
        assert_eq!(session.state(), SessionState::NoMedia);
        assert!(session.render().is_err());

        session
            .load_rgba(8, 4, texture().as_raw().to_vec())
            .expect("load");
        assert_eq!(session.state(), SessionState::TextureReady);

        let frame = session.render().expect("render");
        assert_eq!((frame.width, frame.height), (8, 4));
        assert_eq!(session.state(), SessionState::Rendering);
    }

    #[test]
    fn failed_load_keeps_the_prior_state() {
        let mut session = RenderSession::new(SoftwareRenderer::new());
        let err = session
            .load_path(Path::new("/nonexistent/source.png"))
            .expect_err("missing file");
        assert!(err.is_recoverable());
        assert_eq!(session.state(), SessionState::NoMedia);

        session.bind_texture(texture()).expect("bind");
        session.render().expect("render");
        assert!(session.load_rgba(3, 3, vec![0; 5]).is_err());
        assert_eq!(session.state(), SessionState::Rendering);
        assert!(session.texture().is_some());
        session.render().expect("still renders the previous media");
    }

    #[test]
    fn swapping_media_releases_the_previous_texture() {
        let mut session = RenderSession::new(Counting::default());
        session.bind_texture(texture()).expect("first");
        session.bind_texture(texture()).expect("second");
        session.unload();
        let backend = session.backend.as_ref().expect("backend present");
        assert_eq!(backend.uploads, 2);
        assert_eq!(backend.releases, 2);
        assert_eq!(session.state(), SessionState::NoMedia);
    }

    #[test]
    fn oversized_upload_returns_to_idle() {
        let backend = Counting {
            fail_next_upload: Some(HalftoneError::ResourceExhausted {
                width: 99999,
                height: 10,
                limit: 8192,
            }),
            ..Counting::default()
        };
        let mut session = RenderSession::new(backend);
        let err = session.bind_texture(texture()).expect_err("too large");
        assert_eq!(err.code(), "E_RESOURCE_EXHAUSTED");
        assert_eq!(session.state(), SessionState::NoMedia);
        session.bind_texture(texture()).expect("smaller retry");
    }

    #[test]
    fn failed_initialization_is_terminal() {
        let mut session = RenderSession::<SoftwareRenderer>::initialize(Err(
            HalftoneError::Unsupported("no adapter".into()),
        ));
        assert_eq!(session.state(), SessionState::Unsupported);
        assert!(session.failure().is_some());
        assert!(session.bind_texture(texture()).is_err());
        assert!(session.render().is_err());
        session.unload();
        assert_eq!(session.state(), SessionState::Unsupported);
    }

    #[test]
    fn only_renders_when_something_changed() {
        let mut session = RenderSession::new(SoftwareRenderer::new());
        session.bind_texture(texture()).expect("bind");
        assert!(session.render_if_dirty().expect("first").is_some());
        assert!(session.render_if_dirty().expect("clean").is_none());

        session.set_param("dotSize", "0.5").expect("valid value");
        assert!(session.render_if_dirty().expect("dirty").is_some());

        assert!(session.set_param("dotSize", "huge").is_err());
        assert!(session.render_if_dirty().expect("rejected edit").is_none());

        session.bind_texture(texture()).expect("new frame");
        assert!(session.render_if_dirty().expect("new media").is_some());
    }

    #[test]
    fn renders_follow_the_latest_snapshot() {
        let mut session = RenderSession::new(SoftwareRenderer::new());
        session.bind_texture(texture()).expect("bind");
        // Large enough that the screen is not washed out by the moire fallback.
        session.set_viewport((400, 200), 1.0);
        let handle = session.params().clone();
        let before = session.render().expect("render");

        std::thread::spawn(move || {
            handle.update(|p| {
                p.black.visible = false;
                p.cyan.visible = false;
                p.magenta.visible = false;
                p.yellow.visible = false;
            });
        })
        .join()
        .expect("editor thread");

        let after = session.render_if_dirty().expect("render").expect("dirty");
        assert_ne!(before.rgba, after.rgba);
    }

    #[test]
    fn viewport_letterboxes_the_target() {
        let mut session = RenderSession::new(SoftwareRenderer::new());
        assert!(session.target().is_none());
        session.bind_texture(texture()).expect("bind");
        assert_eq!(session.target(), Some(RenderTarget::new(8, 4)));
        session.set_viewport((100, 100), 2.0);
        assert_eq!(session.target(), Some(RenderTarget::new(200, 100)));
    }

    #[test]
    fn debouncer_coalesces_bursts() {
        let start = Instant::now();
        let mut debounce = Debouncer::new(Duration::from_millis(50));
        assert!(!debounce.fire(start));

        debounce.poke(start);
        debounce.poke(start + Duration::from_millis(30));
        assert!(!debounce.fire(start + Duration::from_millis(60)));
        assert_eq!(
            debounce.remaining(start + Duration::from_millis(60)),
            Some(Duration::from_millis(20))
        );
        assert!(debounce.fire(start + Duration::from_millis(80)));
        assert!(!debounce.fire(start + Duration::from_millis(200)));
        assert!(!debounce.is_pending());
    }

    #[test]
    fn zero_delay_debounce_fires_immediately() {
        let now = Instant::now();
        let mut debounce = Debouncer::new(Duration::ZERO);
        debounce.poke(now);
        assert!(debounce.fire(now));
    }

    #[test]
    fn latest_frame_drops_backlog() {
        let (tx, rx) = mpsc::channel();
        let mut latest = LatestFrame::new(rx);
        assert_eq!(latest.poll(), None);

        for frame in 0..5 {
            tx.send(frame).expect("send");
        }
        assert_eq!(latest.poll(), Some(4));
        assert_eq!(latest.dropped(), 4);

        tx.send(5).expect("send");
        tx.send(6).expect("send");
        assert_eq!(latest.recv(), Some(5));
        tx.send(7).expect("send");
        drop(tx);
        assert_eq!(latest.wait(), Some(7));
        assert_eq!(latest.dropped(), 5);
        assert_eq!(latest.wait(), None);
        assert!(latest.is_closed());
    }

    #[test]
    fn rejected_named_values_do_not_bump_generation() {
        let cell = ParamCell::default();
        assert_eq!(cell.set_named("frequency", "120").expect("valid"), 1);
        assert!(cell.set_named("frequency", "abc").is_err());
        assert!(cell.set_named("nonsense", "1").is_err());
        let (params, generation) = cell.snapshot();
        assert_eq!(generation, 1);
        assert_eq!(params.frequency, 120.0);
    }
}
