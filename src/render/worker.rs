//! Single background thread running render passes.
//!
//! Every request gets a generation number. A running pass polls the shared
//! counter and cancels itself as soon as a newer request exists, so at most
//! one pass is ever in flight and only the newest viewport is rendered.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};

use crate::data::geometry::DRect;
use crate::data::OsmData;
use crate::errors::Result;
use crate::rules::style::Style;
use crate::tiles::TileIndex;

use super::job::{JobStats, RenderContext, RenderJob, RenderStatus};
use super::Renderer;

/// Output of one worker iteration. `status` is `Incomplete` for the
/// intermediate frames of a batched pass.
#[derive(Debug, Clone)]
pub struct RenderedFrame<F> {
    pub generation: u64,
    pub viewport: DRect,
    pub status: RenderStatus,
    pub stats: JobStats,
    pub image: F,
}

struct Request {
    generation: u64,
    viewport: DRect,
}

pub struct RenderWorker<F> {
    requests: Option<Sender<Request>>,
    frames: Receiver<RenderedFrame<F>>,
    generation: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl<F: Send + 'static> RenderWorker<F> {
    /// Starts the worker thread. The renderer is created on that thread by
    /// `make_renderer`; `present` turns its committed output into a frame
    /// for the caller.
    pub fn spawn<R, M, P>(
        data: Arc<OsmData>,
        tiles: Arc<TileIndex>,
        style: Arc<Style>,
        batch_tiles: Option<usize>,
        make_renderer: M,
        present: P,
    ) -> Result<RenderWorker<F>>
    where
        R: Renderer + 'static,
        M: FnOnce() -> R + Send + 'static,
        P: FnMut(&R) -> F + Send + 'static,
    {
        let (request_tx, request_rx) = mpsc::channel();
        let (frame_tx, frame_rx) = mpsc::channel();
        let generation = Arc::new(AtomicU64::new(0));
        let shared = generation.clone();

        let handle = thread::Builder::new()
            .name("render-worker".to_string())
            .spawn(move || {
                let renderer = make_renderer();
                let ctx = RenderContext { data: &data, tiles: &tiles, style: &style };
                serve(ctx, renderer, batch_tiles, present, request_rx, frame_tx, shared);
            })?;
        info!(batch_tiles = batch_tiles.unwrap_or(0); "Render worker started");

        Ok(RenderWorker {
            requests: Some(request_tx),
            frames: frame_rx,
            generation,
            handle: Some(handle),
        })
    }

    /// Asks for `viewport` to be rendered, cancelling any pass in progress.
    /// Returns the generation of the new request.
    pub fn request_render(&self, viewport: DRect) -> Result<u64> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let sender = self.requests.as_ref().ok_or("Render worker is shut down")?;
        sender.send(Request { generation, viewport })
            .map_err(|_| "Render worker has stopped")?;
        Ok(generation)
    }

    pub fn latest_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Blocks for the next frame. `None` once the worker has stopped.
    pub fn recv(&self) -> Option<RenderedFrame<F>> {
        self.frames.recv().ok()
    }

    /// Blocks until the newest request is fully rendered, dropping frames of
    /// older or unfinished passes.
    pub fn wait(&self) -> Option<RenderedFrame<F>> {
        loop {
            let frame = self.recv()?;
            if frame.generation == self.latest_generation() && frame.status == RenderStatus::Complete {
                return Some(frame);
            }
        }
    }

    pub fn shutdown(mut self) {
        self.stop();
    }
}

impl<F> RenderWorker<F> {
    fn stop(&mut self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.requests = None;
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Render worker panicked");
            }
        }
    }
}

impl<F> Drop for RenderWorker<F> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve<R, F, P>(
    ctx: RenderContext,
    mut renderer: R,
    batch_tiles: Option<usize>,
    mut present: P,
    requests: Receiver<Request>,
    frames: Sender<RenderedFrame<F>>,
    generation: Arc<AtomicU64>,
) where
    R: Renderer,
    P: FnMut(&R) -> F,
{
    let mut job = RenderJob::new(DRect::empty());
    let mut active: Option<u64> = None;
    loop {
        let incoming = if active.is_some() {
            match requests.try_recv() {
                Ok(request) => Some(request),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => break,
            }
        } else {
            match requests.recv() {
                Ok(request) => Some(request),
                Err(_) => break,
            }
        };
        if let Some(mut request) = incoming {
            while let Ok(newer) = requests.try_recv() {
                request = newer;
            }
            job.restart(request.viewport);
            active = Some(request.generation);
        }

        let Some(current) = active else {
            continue;
        };
        let status = job.run(&ctx, &mut renderer, batch_tiles, |_| {
            generation.load(Ordering::SeqCst) != current
        });
        if status == RenderStatus::Cancelled {
            debug!(generation = current; "Render pass superseded");
            active = None;
            continue;
        }

        let frame = RenderedFrame {
            generation: current,
            viewport: *job.viewport(),
            status,
            stats: job.stats(),
            image: present(&renderer),
        };
        if job.is_finished() {
            active = None;
        }
        if frames.send(frame).is_err() {
            break;
        }
    }
    debug!("Render worker stopped");
}
