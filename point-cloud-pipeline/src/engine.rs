//! The execution engine: catalog construction, streamed/loaded chunk
//! drivers, the parallel chunk loop with per-worker pipeline clones, merge
//! and the order-restoring sort.

use std::io::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use point_cloud_core::{Chunk, FileCollection, Header, Point, PointCloud, Progress};
use serde_json::Value;

use crate::error::{PipelineError, Result};
use crate::options::ProcessingOptions;
use crate::parser::{self, ParsedPipeline};
use crate::stage::{ChunkContext, Flow, Stage, StageCommon};
use crate::stages::write_lax::WriteLaxStage;

/// How often the point loop polls the cancellation flag.
const INTERRUPT_STRIDE: u64 = 4096;

pub struct Engine {
    stages: Vec<Box<dyn Stage>>,
    options: ProcessingOptions,
    catalog: FileCollection,
    progress: Progress,
    profile: Vec<(usize, f64)>,
}

impl Engine {
    /// Parse the pipeline document and build the catalog behind it.
    pub fn from_json(doc: &Value) -> Result<Self> {
        let ParsedPipeline { mut stages, options, catalog: config } = parser::parse(doc)?;

        let progress = if options.progress {
            Progress::new(0, "Overall")
        } else {
            Progress::hidden(0)
        };

        let mut catalog = FileCollection::new();
        catalog.read(&config.files, &progress)?;

        // The effective buffer is the largest requirement across the user
        // setting and the non-streamable stages.
        let mut buffer = config.buffer;
        for stage in &stages {
            if !stage.is_streamable() {
                buffer = buffer.max(stage.need_buffer());
            }
        }
        catalog.set_buffer(buffer);
        catalog.set_chunk_size(options.chunk);
        for rect in &config.rect_queries {
            catalog.add_query_rect(*rect);
        }
        for circle in &config.circle_queries {
            catalog.add_query_circle(*circle);
        }
        catalog.build_index();

        // A missing index is fixed on the fly by prepending the writer
        // stage in front of the reader.
        if !catalog.check_spatial_index() {
            log::warn!("missing spatial index: a write_lax stage is prepended to the pipeline");
            let common = StageCommon::with_uid("77726974655f6c6178");
            stages.insert(0, Box::new(WriteLaxStage::new(common)));
        }

        let crs = catalog.crs.clone();
        for stage in stages.iter_mut() {
            stage.set_crs(&crs);
            stage.common_mut().ncpu = options.thread_counts().1;
        }

        Ok(Self { stages, options, catalog, progress, profile: Vec::new() })
    }

    pub fn catalog(&self) -> &FileCollection {
        &self.catalog
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    pub fn is_streamable(&self) -> bool {
        self.stages.iter().all(|s| s.is_streamable())
    }

    pub fn is_parallelizable(&self) -> bool {
        self.stages.iter().all(|s| s.is_parallelizable())
    }

    pub fn is_parallelized(&self) -> bool {
        self.stages.iter().any(|s| s.is_parallelized())
    }

    pub fn need_points(&self) -> bool {
        self.stages.iter().any(|s| s.need_points())
    }

    pub fn uses_foreign_callback(&self) -> bool {
        self.stages.iter().any(|s| s.uses_foreign_callback())
    }

    /// Thread counts after the documented demotions.
    fn effective_threads(&self, nchunks: usize) -> (usize, usize) {
        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let (mut outer, mut inner) = self.options.thread_counts();

        if outer > available {
            log::warn!("number of cores requested {outer} but only {available} available");
            outer = available;
        }
        if inner > available {
            inner = available;
        }
        if nchunks == 1 && outer > 1 {
            std::mem::swap(&mut outer, &mut inner);
        }
        outer = outer.min(nchunks.max(1));
        if !self.is_parallelized() && inner > 1 {
            inner = 1;
        }
        if outer > 1 && !self.is_parallelizable() {
            log::warn!("this pipeline is not parallelizable using 'concurrent-files' strategy");
            inner = outer;
            outer = 1;
        }
        if outer > 1 && self.uses_foreign_callback() {
            log::warn!(
                "this pipeline is not parallelizable using 'concurrent-files' strategy because of injected callbacks"
            );
            inner = outer;
            outer = 1;
        }
        (outer.max(1), inner.max(1))
    }

    /// Pre-run: every stage sees the catalog once.
    pub fn pre_run(&mut self) -> Result<()> {
        for stage in self.stages.iter_mut() {
            stage
                .process_collection(&mut self.catalog)
                .map_err(|e| e.in_stage(stage.name(), "processing the catalog"))?;
        }
        Ok(())
    }

    /// Run the whole pipeline: pre-run, the chunk loop (parallel when
    /// requested), merge, sort and the final flush.
    pub fn execute(&mut self) -> Result<()> {
        let started = Instant::now();
        self.pre_run()?;

        let nchunks = self.catalog.num_chunks();
        let (outer, inner) = self.effective_threads(nchunks);

        self.progress = if self.options.progress {
            Progress::new(nchunks as u64, "Overall")
        } else {
            Progress::hidden(nchunks as u64)
        };
        for stage in self.stages.iter_mut() {
            stage.common_mut().progress = self.progress.clone();
        }

        if self.options.verbose {
            log::info!("read points: {}", self.need_points());
            log::info!("streamable: {}", self.is_streamable());
            log::info!("buffer: {:.1}", self.catalog.buffer());
            log::info!("concurrent files: {outer}");
            log::info!("concurrent points: {inner}");
            log::info!("chunks: {nchunks}");
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(inner)
            .build()
            .map_err(|e| PipelineError::InvalidValue {
                key: "ncores".to_string(),
                reason: e.to_string(),
            })?;

        let streamed = self.is_streamable();
        let mut order: Vec<usize> = Vec::new();

        if outer <= 1 {
            for i in 0..nchunks {
                if self.progress.interrupted() {
                    return Err(PipelineError::Interrupted);
                }
                let chunk = match self.catalog.get_chunk(i) {
                    Ok(chunk) => chunk,
                    // A query falling outside the coverage deserves a
                    // warning, not a failure.
                    Err(e @ point_cloud_core::CoreError::EmptyQuery(..)) => {
                        log::warn!("{e}");
                        self.progress.inc(1);
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                };
                let t0 = Instant::now();
                if Self::run_chunk(&mut self.stages, &chunk, streamed, &self.progress, &pool)? {
                    order.push(chunk.id);
                }
                self.profile.push((chunk.id, t0.elapsed().as_secs_f64()));
                self.progress.inc(1);
            }
        } else {
            order = self.run_parallel(outer, nchunks, streamed, &pool)?;
        }

        // Restore a deterministic order before flushing merged outputs: the
        // compacted ranks skip chunks that were never processed.
        order.sort_unstable();
        for stage in self.stages.iter_mut() {
            stage.sort(&order);
        }
        for stage in self.stages.iter_mut() {
            stage
                .clear(true)
                .map_err(|e| e.in_stage(stage.name(), "closing the output"))?;
        }

        self.progress.done();
        self.write_profile(started.elapsed().as_secs_f64())?;
        Ok(())
    }

    /// The outer parallel region: one deep clone of the pipeline per worker,
    /// chunks handed out through a shared cursor (dynamic schedule), clones
    /// merged back in worker order.
    fn run_parallel(
        &mut self,
        outer: usize,
        nchunks: usize,
        streamed: bool,
        pool: &rayon::ThreadPool,
    ) -> Result<Vec<usize>> {
        let cursor = AtomicUsize::new(0);
        let first_error: Mutex<Option<PipelineError>> = Mutex::new(None);
        let catalog = &self.catalog;
        let progress = self.progress.clone();

        let mut clones: Vec<Vec<Box<dyn Stage>>> = (0..outer)
            .map(|_| self.stages.iter().map(|s| s.clone_stage()).collect())
            .collect();

        let worker_outputs: Vec<(Vec<usize>, Vec<(usize, f64)>)> = std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(outer);
            for stages in clones.iter_mut() {
                let cursor = &cursor;
                let first_error = &first_error;
                let progress = progress.clone();
                handles.push(scope.spawn(move || {
                    let mut done = Vec::new();
                    let mut profile = Vec::new();
                    loop {
                        let i = cursor.fetch_add(1, Ordering::Relaxed);
                        if i >= nchunks || progress.interrupted() {
                            break;
                        }
                        let chunk = match catalog.get_chunk(i) {
                            Ok(chunk) => chunk,
                            Err(e @ point_cloud_core::CoreError::EmptyQuery(..)) => {
                                log::warn!("{e}");
                                progress.inc(1);
                                continue;
                            }
                            Err(e) => {
                                let mut slot = first_error.lock().unwrap();
                                if slot.is_none() {
                                    *slot = Some(e.into());
                                }
                                progress.interrupt();
                                continue;
                            }
                        };
                        let t0 = Instant::now();
                        match Self::run_chunk(stages, &chunk, streamed, &progress, pool) {
                            Ok(processed) => {
                                if processed {
                                    done.push(chunk.id);
                                }
                                profile.push((chunk.id, t0.elapsed().as_secs_f64()));
                            }
                            Err(e) => {
                                let mut slot = first_error.lock().unwrap();
                                if slot.is_none() {
                                    *slot = Some(e);
                                }
                                progress.interrupt();
                            }
                        }
                        progress.inc(1);
                    }
                    (done, profile)
                }));
            }
            handles.into_iter().map(|h| h.join().expect("worker panicked")).collect()
        });

        // Merge the clones back into the master pipeline, worker by worker.
        for stages in clones.iter_mut() {
            for (master, clone) in self.stages.iter_mut().zip(stages.iter_mut()) {
                master.merge(clone.as_mut())?;
            }
        }

        if let Some(e) = first_error.into_inner().unwrap() {
            return Err(e);
        }

        let mut order = Vec::new();
        for (done, profile) in worker_outputs {
            order.extend(done);
            self.profile.extend(profile);
        }
        Ok(order)
    }

    /// Process one chunk through every stage. Returns whether the chunk was
    /// actually processed (skipped buffer-only chunks return false).
    fn run_chunk(
        stages: &mut [Box<dyn Stage>],
        chunk: &Chunk,
        streamed: bool,
        progress: &Progress,
        pool: &rayon::ThreadPool,
    ) -> Result<bool> {
        if chunk.is_empty() {
            log::debug!("empty chunk {} skipped", chunk.id);
            return Ok(false);
        }
        if !chunk.process {
            log::debug!("chunk {} is buffer only, skipped", chunk.id);
            return Ok(false);
        }

        for stage in stages.iter_mut() {
            stage
                .set_chunk(chunk)
                .map_err(|e| e.in_stage(stage.name(), "initializing the chunk"))?;
        }

        let result = if streamed {
            Self::run_streamed(stages, progress)
        } else {
            pool.install(|| Self::run_loaded(stages, progress))
        };

        // Per-chunk state is released on every exit path, including errors
        // and cancellation.
        for stage in stages.iter_mut() {
            stage
                .clear(false)
                .map_err(|e| e.in_stage(stage.name(), "clearing the chunk"))?;
        }

        result.map(|_| true)
    }

    fn run_streamed(stages: &mut [Box<dyn Stage>], progress: &Progress) -> Result<()> {
        let mut header: Option<Header> = None;
        for stage in stages.iter_mut() {
            stage
                .init(&mut header)
                .map_err(|e| e.in_stage(stage.name(), "processing the header"))?;
        }
        let Some(header) = header else { return Ok(()) };
        if header.npoints == 0 {
            return Ok(());
        }

        // Prepended pre-run stages (spatial index, manifest) sit in front
        // of the reader and take no part in the point loop.
        let reader = stages
            .iter()
            .position(|s| s.name() == "reader_las")
            .unwrap_or(0);

        let mut seen: u64 = 0;
        'stream: loop {
            if seen % INTERRUPT_STRIDE == 0 && progress.interrupted() {
                return Err(PipelineError::Interrupted);
            }
            seen += 1;

            let mut point: Option<Point> = None;
            for (k, stage) in stages[reader..].iter_mut().enumerate() {
                stage
                    .process_point(&mut point, &header)
                    .map_err(|e| e.in_stage(stage.name(), "processing a point"))?;
                if point.is_none() {
                    if k == 0 {
                        // The reader exhausted the chunk.
                        break 'stream;
                    }
                    // A stage dropped the point; move to the next one.
                    continue 'stream;
                }
            }
        }

        for stage in stages.iter_mut() {
            stage
                .write()
                .map_err(|e| e.in_stage(stage.name(), "writing the output"))?;
        }
        Ok(())
    }

    fn run_loaded(stages: &mut [Box<dyn Stage>], progress: &Progress) -> Result<()> {
        let mut header: Option<Header> = None;
        let mut cloud = PointCloud::default();
        let mut ctx = ChunkContext::default();

        for stage in stages.iter_mut() {
            if progress.interrupted() {
                return Err(PipelineError::Interrupted);
            }

            stage
                .init(&mut header)
                .map_err(|e| e.in_stage(stage.name(), "processing the header"))?;
            let Some(header) = header.as_ref() else { continue };
            if header.npoints == 0 {
                return Ok(());
            }

            // Stages that need no points still run: they work off the chunk
            // context (connected stages) or do nothing.
            let flow = stage
                .process_cloud(&mut cloud, &mut ctx)
                .map_err(|e| e.in_stage(stage.name(), "processing the point cloud"))?;
            if flow == Flow::Break {
                break;
            }

            stage
                .write()
                .map_err(|e| e.in_stage(stage.name(), "writing the output"))?;
        }
        Ok(())
    }

    fn write_profile(&self, total: f64) -> Result<()> {
        let Some(path) = &self.options.profiling else { return Ok(()) };
        let mut out = std::fs::File::create(path)?;
        for (chunk, seconds) in &self.profile {
            writeln!(out, "chunk {chunk} {seconds:.3}")?;
        }
        writeln!(out, "total {total:.3}")?;
        Ok(())
    }
}
