//! Estimator driver: the sliding-window state machine and its worker
//! thread.
//!
//! One cycle per dequeued feature frame:
//! 1. scan-to-scan tracking (all sensors while bootstrapping, reference
//!    only afterwards) and, while bootstrapping, hand-eye accumulation;
//! 2. write the newest pose and downsampled feature stacks into the
//!    window;
//! 3. INITIAL: slide; NON_LINEAR: build map → solve → marginalize →
//!    slide, then check calibration convergence;
//! 4. keep the coarse feature grades as the next cycle's previous frame.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{bail, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use nalgebra::{UnitQuaternion, Vector3};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::calib::ExtrinsicInitializer;
use crate::cloud::{PointCloud, VoxelGrid};
use crate::features::{Feature, FeatureExtractor, PlanarExtractor, ScanFeatures};
use crate::geometry::SE3;
use crate::optimizer::{
    self, degeneracy, lm, BlockKey, ExtrinsicPriorFactor, FactorKind, MarginalFactorEntry,
    MarginalPrior, PlaneNormFactor, Problem, SolverOptions, TargetPlaneFactor,
};
use crate::tracking::{IcpTracker, ScanTracker};
use crate::window::SlidingWindow;

use super::config::{EstimatorConfig, ExtrinsicMode};
use super::local_map::{build_calib_map, build_local_map, LocalMaps};

/// Voxel leaves for the per-frame feature stacks.
const STACK_SURF_LEAF: f64 = 0.4;
const STACK_EDGE_LEAF: f64 = 0.2;

/// Worker idle wait between queue polls.
const QUEUE_POLL: Duration = Duration::from_millis(2);

/// One dequeued input: a stamp plus per-sensor features.
pub struct FeatureFrame {
    pub t: f64,
    pub features: Vec<ScanFeatures>,
}

/// Driver phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverFlag {
    Initial,
    NonLinear,
}

/// One sensor's mounting: rotation, translation, time offset.
#[derive(Debug, Clone)]
pub struct SensorExtrinsic {
    pub rot: UnitQuaternion<f64>,
    pub trans: Vector3<f64>,
    pub td: f64,
}

impl SensorExtrinsic {
    pub fn pose(&self) -> SE3 {
        SE3::from_qt(self.rot, self.trans)
    }
}

/// What the publisher pulls after any cycle.
#[derive(Debug, Clone)]
pub struct EstimatorSnapshot {
    pub stamp: f64,
    pub pose: SE3,
    pub extrinsics: Vec<SE3>,
    pub solver_flag: SolverFlag,
    pub extrinsic_mode: ExtrinsicMode,
    pub surf_local_maps: Vec<PointCloud>,
}

/// All mutable estimator state, guarded by the process mutex.
struct EstimatorState {
    cfg: EstimatorConfig,

    system_inited: bool,
    prev_time: f64,
    cur_time: f64,
    frame_count: usize,

    solver_flag: SolverFlag,
    mode: ExtrinsicMode,

    pose_rlt: Vec<SE3>,
    pose_cur: Vec<SE3>,
    extrinsics: Vec<SensorExtrinsic>,
    initializer: ExtrinsicInitializer,

    window: SlidingWindow,
    ini_fixed_local_map: bool,
    maps: LocalMaps,

    cumu_surf_features: Vec<Vec<Vec<Feature>>>,
    cumu_edge_features: Vec<Vec<Vec<Feature>>>,

    prior: Option<MarginalPrior>,
    eig_thresholds: Vec<f64>,
    last_degeneracy: Vec<usize>,

    prev_features: Option<Vec<ScanFeatures>>,
    tracker: Box<dyn ScanTracker>,

    surf_filter: VoxelGrid,
    edge_filter: VoxelGrid,
}

impl EstimatorState {
    fn new(cfg: EstimatorConfig, tracker: Box<dyn ScanTracker>) -> Self {
        let n = cfg.num_lasers;
        let extrinsics = cfg
            .extrinsics
            .iter()
            .map(|g| {
                let pose = g.to_pose();
                SensorExtrinsic {
                    rot: pose.rotation,
                    trans: pose.translation,
                    td: g.tdbl,
                }
            })
            .collect();
        Self {
            system_inited: false,
            prev_time: -1.0,
            cur_time: 0.0,
            frame_count: 0,
            solver_flag: SolverFlag::Initial,
            mode: cfg.estimate_extrinsic,
            pose_rlt: vec![SE3::identity(); n],
            pose_cur: vec![SE3::identity(); n],
            extrinsics,
            initializer: ExtrinsicInitializer::new(n, cfg.idx_ref),
            window: SlidingWindow::new(cfg.window_size, n),
            ini_fixed_local_map: false,
            maps: LocalMaps::default(),
            cumu_surf_features: vec![Vec::new(); n],
            cumu_edge_features: vec![Vec::new(); n],
            prior: None,
            eig_thresholds: vec![cfg.eig_initial; cfg.opt_window_size + 1 + n],
            last_degeneracy: vec![0; cfg.opt_window_size + 1 + n],
            prev_features: None,
            tracker,
            surf_filter: VoxelGrid::new(STACK_SURF_LEAF),
            edge_filter: VoxelGrid::new(STACK_EDGE_LEAF),
            cfg,
        }
    }

    fn clear(&mut self) {
        info!("estimator: clear state");
        let cfg = self.cfg.clone();
        let tracker = std::mem::replace(&mut self.tracker, Box::new(IcpTracker::default()));
        *self = EstimatorState::new(cfg, tracker);
    }

    /// One full cycle for a dequeued frame.
    fn process(&mut self, frame: FeatureFrame) {
        self.frame_count += 1;
        self.cur_time = frame.t;
        debug!(
            frame = self.frame_count,
            t = self.cur_time,
            dt = self.cur_time - self.prev_time,
            "cycle start"
        );
        let idx_ref = self.cfg.idx_ref;
        let cnt = self.window.fill_count();

        if !self.system_inited {
            self.system_inited = true;
            info!("system initialization finished");
        } else {
            let prev_features = self
                .prev_features
                .as_ref()
                .expect("previous features exist after init");
            if self.mode == ExtrinsicMode::Bootstrap {
                // Track every sensor independently and feed the hand-eye
                // initializer with the relative motions.
                for n in 0..self.cfg.num_lasers {
                    let rlt =
                        self.tracker
                            .track(&prev_features[n], &frame.features[n], &self.pose_rlt[n]);
                    self.pose_cur[n] = self.pose_cur[n].compose(&rlt);
                    self.pose_rlt[n] = rlt;
                    debug!(sensor = n, rel = %self.pose_rlt[n], "tracker");
                }
                for n in 0..self.cfg.num_lasers {
                    self.initializer.add_pose(self.pose_rlt[n].clone(), n);
                }
                if cnt == self.cfg.window_size {
                    self.try_bootstrap_extrinsics();
                }
            } else {
                let rlt = self.tracker.track(
                    &prev_features[idx_ref],
                    &frame.features[idx_ref],
                    &self.pose_rlt[idx_ref],
                );
                self.pose_rlt[idx_ref] = rlt;
                let prev_pose = self.window.poses.get(cnt - 1).clone();
                self.pose_cur[idx_ref] = prev_pose.compose(&self.pose_rlt[idx_ref]);
                debug!(rel = %self.pose_rlt[idx_ref], cur = %self.pose_cur[idx_ref], "tracker");
            }
        }

        // Newest state and measurements into slot `cnt`.
        *self.window.poses.get_mut(cnt) = self.pose_cur[idx_ref].clone();
        *self.window.stamps.get_mut(cnt) = frame.t;
        for n in 0..self.cfg.num_lasers {
            let surf = self.surf_filter.filter(&frame.features[n].surf_less);
            *self.window.surf_stack_size[n].get_mut(cnt) = surf.len();
            *self.window.surf_stack[n].get_mut(cnt) = surf;
            let edge = self.edge_filter.filter(&frame.features[n].edge_less);
            *self.window.edge_stack_size[n].get_mut(cnt) = edge.len();
            *self.window.edge_stack[n].get_mut(cnt) = edge;
        }

        match self.solver_flag {
            SolverFlag::Initial => {
                debug!(frame = self.frame_count, "[INITIAL]");
                self.slide_window();
                self.window.advance_fill();
                if self.window.is_full() && self.mode != ExtrinsicMode::Bootstrap {
                    self.solver_flag = SolverFlag::NonLinear;
                    info!("window full, switching to NON_LINEAR");
                }
            }
            SolverFlag::NonLinear => {
                debug!(frame = self.frame_count, "[NON_LINEAR]");
                self.optimize_map();
                self.slide_window();
                if self.mode != ExtrinsicMode::Frozen {
                    self.eval_calib();
                }
            }
        }

        // Keep only the coarse grades of the current frame around.
        self.prev_time = self.cur_time;
        self.prev_features = Some(frame.features.iter().map(|f| f.less_only()).collect());
    }

    /// Hand-eye bootstrap attempt, once the window is full.
    fn try_bootstrap_extrinsics(&mut self) {
        for n in 0..self.cfg.num_lasers {
            if self.initializer.cov_rot_state[n] || self.initializer.calib_rotation(n).is_some() {
                self.initializer.set_cov_rotation(n);
                if !self.initializer.cov_pos_state[n] {
                    if let Some(result) = self.initializer.calib_translation(n) {
                        self.initializer.set_cov_translation(n);
                        warn!(sensor = n, extrinsic = %result, "initial extrinsic");
                        self.extrinsics[n].rot = result.rotation;
                        self.extrinsics[n].trans = result.translation;
                    }
                }
            }
        }
        if self.initializer.full_cov_rot_state && self.initializer.full_cov_pos_state {
            warn!("all initial extrinsics calibrated, entering online refinement");
            for n in 0..self.cfg.num_lasers {
                if let Some(stats) = self.initializer.statistics(n) {
                    info!(sensor = n, ?stats, "bootstrap statistics");
                }
            }
            self.mode = ExtrinsicMode::Refine;
        }
    }

    fn plane_wiring(&self, slot: usize, sensor: usize) -> [BlockKey; 3] {
        [
            BlockKey::Pose(0),
            BlockKey::Pose(slot - self.cfg.pivot_idx()),
            BlockKey::Extrinsic(sensor),
        ]
    }

    /// Build map, assemble the problem, analyze degeneracy, solve, write
    /// back, marginalize.
    fn optimize_map(&mut self) {
        let cfg = self.cfg.clone();
        let pivot_idx = cfg.pivot_idx();
        let ext_poses: Vec<SE3> = self.extrinsics.iter().map(|e| e.pose()).collect();

        // ------------------------------------------------------------------
        // Local map and correspondences.
        let calib_ready;
        if self.mode == ExtrinsicMode::Refine {
            self.maps = build_calib_map(
                &mut self.window,
                &ext_poses,
                pivot_idx,
                cfg.idx_ref,
                &mut self.ini_fixed_local_map,
                cfg.point_edge_factor,
            );
            if cfg.point_plane_factor {
                for n in 0..cfg.num_lasers {
                    self.cumu_surf_features[n].push(self.maps.surf_features[n][pivot_idx].clone());
                }
            }
            if cfg.point_edge_factor {
                for n in 0..cfg.num_lasers {
                    self.cumu_edge_features[n].push(self.maps.edge_features[n][pivot_idx].clone());
                }
            }
            calib_ready = self.cumu_surf_features[cfg.idx_ref].len() == cfg.n_cumu_feature
                || self.cumu_edge_features[cfg.idx_ref].len() == cfg.n_cumu_feature;
        } else {
            self.maps = build_local_map(
                &mut self.window,
                &ext_poses,
                pivot_idx,
                &mut self.ini_fixed_local_map,
                cfg.point_edge_factor,
            );
            calib_ready = false;
        }

        // ------------------------------------------------------------------
        // Parameter blocks: poses [pivot..=W] then extrinsics.
        let mut problem = Problem::new();
        for i in 0..=cfg.opt_window_size {
            problem.add_block(
                BlockKey::Pose(i),
                self.window.poses.get(pivot_idx + i).clone(),
                i == 0,
            );
        }
        for n in 0..cfg.num_lasers {
            let fixed = n == cfg.idx_ref || self.mode == ExtrinsicMode::Frozen;
            problem.add_block(BlockKey::Extrinsic(n), ext_poses[n].clone(), fixed);
        }

        // ------------------------------------------------------------------
        // Factors.
        if cfg.marginalization_factor {
            if let Some(prior) = &self.prior {
                problem.add_residual(
                    FactorKind::Marginal(Arc::new(prior.clone())),
                    &prior.keys.clone(),
                );
            }
        }
        if cfg.prior_factor {
            for n in 0..cfg.num_lasers {
                problem.add_residual(
                    FactorKind::ExtrinsicPrior(self.extrinsic_prior(n)),
                    &[BlockKey::Extrinsic(n)],
                );
            }
        }

        if self.mode == ExtrinsicMode::Refine {
            if cfg.point_plane_factor {
                for i in pivot_idx + 1..=cfg.window_size {
                    for f in &self.maps.surf_features[cfg.idx_ref][i] {
                        problem.add_residual(
                            FactorKind::PlaneNorm(plane_factor(f)),
                            &self.plane_wiring(i, cfg.idx_ref),
                        );
                    }
                }
            }
            if calib_ready {
                warn!("injecting batched calibration factors");
                for n in 0..cfg.num_lasers {
                    if n == cfg.idx_ref {
                        continue;
                    }
                    for frame in self
                        .cumu_surf_features[n]
                        .iter()
                        .chain(self.cumu_edge_features[n].iter())
                    {
                        for f in frame {
                            problem.add_residual(
                                FactorKind::TargetPlane(target_factor(f)),
                                &[BlockKey::Extrinsic(n)],
                            );
                        }
                    }
                }
                if !cfg.marginalization_factor {
                    self.clear_cumu_features();
                }
            }
        } else {
            if cfg.point_plane_factor {
                for n in 0..cfg.num_lasers {
                    for i in pivot_idx + 1..=cfg.window_size {
                        for f in &self.maps.surf_features[n][i] {
                            problem.add_residual(
                                FactorKind::PlaneNorm(plane_factor(f)),
                                &self.plane_wiring(i, n),
                            );
                        }
                    }
                }
            }
            if cfg.point_edge_factor {
                for n in 0..cfg.num_lasers {
                    for i in pivot_idx + 1..=cfg.window_size {
                        for f in &self.maps.edge_features[n][i] {
                            problem.add_residual(
                                FactorKind::PlaneNorm(plane_factor(f)),
                                &self.plane_wiring(i, n),
                            );
                        }
                    }
                }
            }
        }

        if cfg.check_jacobian {
            if let Some(rb) = problem.residuals.first() {
                let values: Vec<&SE3> = rb
                    .block_ids
                    .iter()
                    .map(|&id| &problem.blocks[id].value)
                    .collect();
                rb.factor.check(&values);
            }
        }

        // ------------------------------------------------------------------
        // Pre-solve evaluation feeds the degeneracy analyzer.
        let (residuals, jacobian) = problem.evaluate(true);
        debug!(
            cost = 0.5 * residuals.norm_squared(),
            residuals = residuals.len(),
            "before optimization"
        );
        self.last_degeneracy = degeneracy::analyze(
            &mut problem,
            jacobian.as_ref().expect("jacobian requested"),
            &mut self.eig_thresholds,
            cfg.opt_window_size,
        );
        if self.last_degeneracy.iter().any(|&z| z > 0) {
            debug!(nullity = ?self.last_degeneracy, "degenerate parameter blocks");
        }

        let summary = lm::solve(
            &mut problem,
            &SolverOptions {
                max_iterations: cfg.num_iterations,
                max_time: Duration::from_secs_f64(cfg.solver_time),
                ..SolverOptions::default()
            },
        );
        info!(%summary, "sliding-window solve");

        // ------------------------------------------------------------------
        // Write back.
        for i in 0..=cfg.opt_window_size {
            *self.window.poses.get_mut(pivot_idx + i) = problem
                .value(BlockKey::Pose(i))
                .expect("pose block exists")
                .clone();
        }
        for n in 0..cfg.num_lasers {
            let value = problem
                .value(BlockKey::Extrinsic(n))
                .expect("extrinsic block exists");
            self.extrinsics[n].rot = value.rotation;
            self.extrinsics[n].trans = value.translation;
        }

        if cfg.marginalization_factor {
            self.marginalize_pivot(&problem, calib_ready);
        }
    }

    fn extrinsic_prior(&self, n: usize) -> ExtrinsicPriorFactor {
        ExtrinsicPriorFactor {
            t_prior: self.extrinsics[n].trans,
            q_prior: self.extrinsics[n].rot,
            pos_info: self.cfg.prior_factor_pos,
            rot_info: self.cfg.prior_factor_rot,
        }
    }

    /// Form the new prior from everything touching the pivot, at the
    /// post-solve linearization point, then relabel pose keys for the
    /// upcoming slide. The previous prior is consumed here, exactly once.
    fn marginalize_pivot(&mut self, problem: &Problem, calib_ready: bool) {
        let cfg = self.cfg.clone();
        let pivot_idx = cfg.pivot_idx();

        let mut entries: Vec<MarginalFactorEntry> = Vec::new();
        if let Some(prior) = self.prior.take() {
            let keys = prior.keys.clone();
            entries.push(MarginalFactorEntry {
                factor: FactorKind::Marginal(Arc::new(prior)),
                keys,
            });
        }
        if cfg.prior_factor {
            for n in 0..cfg.num_lasers {
                entries.push(MarginalFactorEntry {
                    factor: FactorKind::ExtrinsicPrior(self.extrinsic_prior(n)),
                    keys: vec![BlockKey::Extrinsic(n)],
                });
            }
        }

        if self.mode == ExtrinsicMode::Refine {
            if cfg.point_plane_factor {
                for i in pivot_idx + 1..=cfg.window_size {
                    for f in &self.maps.surf_features[cfg.idx_ref][i] {
                        entries.push(MarginalFactorEntry {
                            factor: FactorKind::PlaneNorm(plane_factor(f)),
                            keys: self.plane_wiring(i, cfg.idx_ref).to_vec(),
                        });
                    }
                }
            }
            if calib_ready {
                for n in 0..cfg.num_lasers {
                    if n == cfg.idx_ref {
                        continue;
                    }
                    for frame in self
                        .cumu_surf_features[n]
                        .iter()
                        .chain(self.cumu_edge_features[n].iter())
                    {
                        for f in frame {
                            entries.push(MarginalFactorEntry {
                                factor: FactorKind::TargetPlane(target_factor(f)),
                                keys: vec![BlockKey::Extrinsic(n)],
                            });
                        }
                    }
                }
                self.clear_cumu_features();
            }
        } else {
            for n in 0..cfg.num_lasers {
                for i in pivot_idx + 1..=cfg.window_size {
                    if cfg.point_plane_factor {
                        for f in &self.maps.surf_features[n][i] {
                            entries.push(MarginalFactorEntry {
                                factor: FactorKind::PlaneNorm(plane_factor(f)),
                                keys: self.plane_wiring(i, n).to_vec(),
                            });
                        }
                    }
                    if cfg.point_edge_factor {
                        for f in &self.maps.edge_features[n][i] {
                            entries.push(MarginalFactorEntry {
                                factor: FactorKind::PlaneNorm(plane_factor(f)),
                                keys: self.plane_wiring(i, n).to_vec(),
                            });
                        }
                    }
                }
            }
        }

        let values = problem
            .blocks
            .iter()
            .map(|b| (b.key, b.value.clone()))
            .collect();
        match optimizer::marginalize(&entries, &values, BlockKey::Pose(0)) {
            Some(mut prior) => {
                prior.shift_pose_keys();
                self.prior = Some(prior);
            }
            None => self.prior = None,
        }
    }

    fn clear_cumu_features(&mut self) {
        self.cumu_surf_features = vec![Vec::new(); self.cfg.num_lasers];
        self.cumu_edge_features = vec![Vec::new(); self.cfg.num_lasers];
    }

    /// Merge the pivot snapshot into the next pivot slot (dropping the
    /// oldest frame's contribution), then rotate the window.
    fn slide_window(&mut self) {
        if self.ini_fixed_local_map {
            let pivot_idx = self.cfg.pivot_idx();
            let next = pivot_idx + 1;
            let pose_pivot = self.window.poses.get(pivot_idx).clone();
            let pose_next = self.window.poses.get(next).clone();

            for n in 0..self.cfg.num_lasers {
                if self.mode == ExtrinsicMode::Refine && n != self.cfg.idx_ref {
                    continue;
                }
                let ext = self.extrinsics[n].pose();
                // pivot sensor frame → next-pivot sensor frame
                let shift = pose_next
                    .compose(&ext)
                    .inverse()
                    .compose(&pose_pivot)
                    .compose(&ext);

                let dropped = *self.window.surf_stack_size[n].get(0);
                let mut merged = self.window.surf_stack[n].get(pivot_idx).transformed(&shift);
                merged.drop_front(dropped);
                merged.extend_from(self.window.surf_stack[n].get(next));
                *self.window.surf_stack[n].get_mut(next) = merged;

                if self.cfg.point_edge_factor {
                    let dropped = *self.window.edge_stack_size[n].get(0);
                    let mut merged =
                        self.window.edge_stack[n].get(pivot_idx).transformed(&shift);
                    merged.drop_front(dropped);
                    merged.extend_from(self.window.edge_stack[n].get(next));
                    *self.window.edge_stack[n].get_mut(next) = merged;
                }
            }
        }
        self.window.slide();
    }

    /// Declare calibration converged when every non-reference extrinsic
    /// block's recorded eigenvalue cleared the configured level. The
    /// marginalization prior is discarded: its linearization point
    /// includes extrinsic components about to freeze.
    fn eval_calib(&mut self) {
        if self.solver_flag != SolverFlag::NonLinear {
            return;
        }
        let offset = self.cfg.opt_window_size + 1;
        let converged = (0..self.cfg.num_lasers)
            .filter(|&n| n != self.cfg.idx_ref)
            .all(|n| self.eig_thresholds[offset + n] >= self.cfg.eig_thre_calib);
        if converged {
            warn!("nonlinear calibration finished, extrinsics frozen");
            self.mode = ExtrinsicMode::Frozen;
            self.ini_fixed_local_map = false;
            self.prior = None;
        }
    }

    fn snapshot(&self) -> EstimatorSnapshot {
        let latest = if self.window.is_full() {
            self.cfg.window_size
        } else {
            self.window.fill_count().saturating_sub(1)
        };
        EstimatorSnapshot {
            stamp: *self.window.stamps.get(latest),
            pose: self.window.poses.get(latest).clone(),
            extrinsics: self.extrinsics.iter().map(|e| e.pose()).collect(),
            solver_flag: self.solver_flag,
            extrinsic_mode: self.mode,
            surf_local_maps: self.maps.surf_filtered.clone(),
        }
    }
}

fn plane_factor(f: &Feature) -> PlaneNormFactor {
    PlaneNormFactor {
        point: f.point,
        coeffs: f.coeffs,
        score: f.score,
    }
}

fn target_factor(f: &Feature) -> TargetPlaneFactor {
    TargetPlaneFactor {
        point: f.point,
        coeffs: f.coeffs,
        score: f.score,
    }
}

struct EstimatorCore {
    state: Mutex<EstimatorState>,
    receiver: Receiver<FeatureFrame>,
    shutdown: AtomicBool,
}

impl EstimatorCore {
    fn drain_pending(&self) {
        while let Ok(frame) = self.receiver.try_recv() {
            self.state.lock().process(frame);
        }
    }

    fn run_worker(&self) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            match self.receiver.recv_timeout(QUEUE_POLL) {
                Ok(frame) => {
                    self.state.lock().process(frame);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }
}

/// The multi-LiDAR estimator.
///
/// `input_cloud` runs the feature extractor on the caller's thread and
/// enqueues the result; the worker thread (or the caller, in
/// single-threaded mode) advances the window one cycle per frame.
/// Everything the publisher needs is pulled through `snapshot`.
pub struct Estimator {
    cfg: EstimatorConfig,
    extractor: Box<dyn FeatureExtractor>,
    sender: Option<Sender<FeatureFrame>>,
    core: Arc<EstimatorCore>,
    worker: Option<JoinHandle<()>>,
}

impl Estimator {
    pub fn new(cfg: EstimatorConfig) -> Result<Self> {
        Self::with_parts(
            cfg,
            Box::new(PlanarExtractor::new()),
            Box::new(IcpTracker::default()),
        )
    }

    /// Construct with a custom front-end and tracker.
    pub fn with_parts(
        cfg: EstimatorConfig,
        extractor: Box<dyn FeatureExtractor>,
        tracker: Box<dyn ScanTracker>,
    ) -> Result<Self> {
        cfg.validate()?;
        for (n, e) in cfg.extrinsics.iter().enumerate() {
            info!(sensor = n, extrinsic = %e.to_pose(), "given extrinsic");
        }

        let (sender, receiver) = unbounded();
        let core = Arc::new(EstimatorCore {
            state: Mutex::new(EstimatorState::new(cfg.clone(), tracker)),
            receiver,
            shutdown: AtomicBool::new(false),
        });

        let worker = if cfg.multiple_thread {
            let core = Arc::clone(&core);
            Some(std::thread::spawn(move || core.run_worker()))
        } else {
            None
        };

        Ok(Self {
            cfg,
            extractor,
            sender: Some(sender),
            core,
            worker,
        })
    }

    /// Ingest one synchronized sweep: one cloud per sensor, in sensor
    /// frames. Fails fast on a sensor-count mismatch.
    pub fn input_cloud(&mut self, t: f64, clouds: &[PointCloud]) -> Result<()> {
        if clouds.len() != self.cfg.num_lasers {
            bail!(
                "expected {} clouds per frame, got {}",
                self.cfg.num_lasers,
                clouds.len()
            );
        }

        let features = clouds
            .iter()
            .map(|c| self.extractor.extract(t, c))
            .collect();
        self.sender
            .as_ref()
            .expect("sender lives as long as the estimator")
            .send(FeatureFrame { t, features })
            .ok();

        if !self.cfg.multiple_thread {
            self.core.drain_pending();
        }
        Ok(())
    }

    /// Reserved reconfiguration gate; currently never restarts.
    pub fn change_sensor_type(&mut self, _use_imu: bool, _use_stereo: bool) {
        let restart = false;
        let _guard = self.core.state.lock();
        drop(_guard);
        if restart {
            self.clear_state();
        }
    }

    /// Hard reset between cycles.
    pub fn clear_state(&mut self) {
        self.core.state.lock().clear();
    }

    /// Latest trajectory point, extrinsics, phase and local maps.
    pub fn snapshot(&self) -> EstimatorSnapshot {
        self.core.state.lock().snapshot()
    }

    /// Frames processed so far.
    pub fn frame_count(&self) -> usize {
        self.core.state.lock().frame_count
    }
}

impl Drop for Estimator {
    fn drop(&mut self) {
        self.core.shutdown.store(true, Ordering::SeqCst);
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
#[path = "tests.rs"]
mod tests;
