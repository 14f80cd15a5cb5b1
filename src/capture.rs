//! Image capture from a driving simulator.
//!
//! A run loads a map, fills it with autopilot traffic, puts a camera on one more "ego" vehicle
//! and saves its frames until a randomly chosen number of images has been collected. The
//! simulator is reached through the [Simulator] trait; the CARLA implementation lives in the
//! `carla` module behind the `carla` feature.
//!
//! Every actor spawned by a run is owned by a [CaptureSession], which destroys them when it is
//! dropped. Leaving [run_capture] by any path (target reached, Ctrl-C, error) therefore stops
//! and destroys the camera, then the ego vehicle, then the traffic, exactly once.

extern crate image;
extern crate nalgebra as na;
extern crate rand;

use image::RgbImage;
use log::{debug, info, warn};
use na::Point3;
use rand::seq::SliceRandom;
use rand::Rng;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use crate::{progress_bar, Error};

/// Position and orientation of an actor. Angles are in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub location: Point3<f64>,
    pub pitch: f64,
    pub yaw: f64,
    pub roll: f64,
}

impl Transform {
    pub fn from_location(x: f64, y: f64, z: f64) -> Self {
        Transform {
            location: Point3::new(x, y, z),
            pitch: 0.0,
            yaw: 0.0,
            roll: 0.0,
        }
    }
}

/// One frame delivered by a camera sensor.
#[derive(Debug, Clone)]
pub struct CapturedImage {
    /// Simulation frame number the image was taken at.
    pub frame: u64,
    pub image: RgbImage,
}

/// RGB camera mounted on the ego vehicle.
#[derive(Debug, Clone)]
pub struct CameraSpec {
    pub blueprint: String,
    pub width: u32,
    pub height: u32,
    /// Horizontal field of view in degrees.
    pub fov: f64,
    /// Seconds of simulation time between two images.
    pub sensor_tick: f64,
    /// Mounting point relative to the vehicle.
    pub mount: Transform,
}

impl Default for CameraSpec {
    fn default() -> Self {
        CameraSpec {
            blueprint: "sensor.camera.rgb".to_string(),
            width: 4000,
            height: 3000,
            fov: 110.0,
            sensor_tick: 2.0,
            mount: Transform::from_location(1.5, 0.0, 2.4),
        }
    }
}

impl CameraSpec {
    /// Blueprint attributes to set before spawning the camera.
    pub fn attributes(&self) -> Vec<(&'static str, String)> {
        vec![
            ("image_size_x", self.width.to_string()),
            ("image_size_y", self.height.to_string()),
            ("fov", self.fov.to_string()),
            ("sensor_tick", self.sensor_tick.to_string()),
        ]
    }
}

/// Something living in the simulated world.
pub trait Actor {
    fn id(&self) -> u32;

    /// Remove the actor from the world.
    fn destroy(&mut self) -> Result<(), Error>;
}

pub trait Vehicle: Actor {
    /// Hand control of the vehicle to the traffic manager listening on `tm_port`.
    fn set_autopilot(&mut self, enabled: bool, tm_port: u16) -> Result<(), Error>;
}

pub trait Sensor: Actor {
    /// Start streaming data. `callback` is invoked from the simulator's own threads, once per
    /// frame and never concurrently.
    fn listen(&mut self, callback: Box<dyn FnMut(CapturedImage) + Send>) -> Result<(), Error>;

    /// Stop streaming. No callback runs after this returns.
    fn stop(&mut self) -> Result<(), Error>;
}

/// Connection to a simulation server.
pub trait Simulator {
    type Vehicle: Vehicle;
    type Camera: Sensor;

    fn load_world(&mut self, map: &str) -> Result<(), Error>;

    /// Ids of all vehicle blueprints.
    fn vehicle_blueprints(&self) -> Result<Vec<String>, Error>;

    /// Recommended spawn points of the current map.
    fn spawn_points(&self) -> Result<Vec<Transform>, Error>;

    /// Spawn a vehicle, or `None` if the spot is taken.
    fn try_spawn_vehicle(
        &mut self,
        blueprint: &str,
        at: &Transform,
    ) -> Result<Option<Self::Vehicle>, Error>;

    /// Port of the traffic manager driving autopilot vehicles.
    fn traffic_manager_port(&mut self) -> Result<u16, Error>;

    fn spawn_camera(
        &mut self,
        spec: &CameraSpec,
        parent: &Self::Vehicle,
    ) -> Result<Self::Camera, Error>;
}

/// Owner of every actor spawned for one capture run.
///
/// Tearing down stops and destroys the camera, then destroys the ego vehicle, then the
/// background vehicles in spawn order. Actors are taken out as they are destroyed so teardown
/// runs at most once per actor, and only for actors that were actually created.
pub struct CaptureSession<V: Vehicle, C: Sensor> {
    pub camera: Option<C>,
    pub ego: Option<V>,
    pub npcs: Vec<V>,
}

impl<V: Vehicle, C: Sensor> CaptureSession<V, C> {
    pub fn new() -> Self {
        CaptureSession {
            camera: None,
            ego: None,
            npcs: Vec::new(),
        }
    }

    pub fn num_actors(&self) -> usize {
        self.camera.iter().count() + self.ego.iter().count() + self.npcs.len()
    }

    pub fn teardown(&mut self) {
        let num_actors = self.num_actors();
        if num_actors == 0 {
            return;
        }
        if let Some(mut camera) = self.camera.take() {
            if let Err(e) = camera.stop() {
                warn!("Could not stop camera {}: {}", camera.id(), e);
            }
            if let Err(e) = camera.destroy() {
                warn!("Could not destroy camera {}: {}", camera.id(), e);
            }
        }
        if let Some(mut ego) = self.ego.take() {
            if let Err(e) = ego.destroy() {
                warn!("Could not destroy ego vehicle {}: {}", ego.id(), e);
            }
        }
        for mut v in self.npcs.drain(..) {
            if let Err(e) = v.destroy() {
                warn!("Could not destroy vehicle {}: {}", v.id(), e);
            }
        }
        info!("Cleaned up {} actors", num_actors);
    }
}

impl<V: Vehicle, C: Sensor> Drop for CaptureSession<V, C> {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub map: String,
    /// Upper bound on background vehicles.
    pub max_npcs: usize,
    pub camera: CameraSpec,
    pub output_dir: PathBuf,
    /// The number of images to collect is drawn uniformly from `[start, end)`.
    pub target_range: (usize, usize),
    /// How long the main loop waits for a frame before checking for interruption again.
    pub poll_interval: Duration,
    pub verbose: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            map: "Town10HD_Opt".to_string(),
            max_npcs: 50,
            camera: CameraSpec::default(),
            output_dir: PathBuf::from("out"),
            target_range: (150, 300),
            poll_interval: Duration::from_millis(100),
            verbose: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureOutcome {
    pub target: usize,
    pub captured: usize,
    /// The run was stopped before reaching `target`.
    pub interrupted: bool,
}

/// Path of the image for simulation frame `frame`.
pub fn frame_path(output_dir: &Path, frame: u64) -> PathBuf {
    output_dir.join(format!("{:06}.png", frame))
}

/// Install a Ctrl-C handler that raises the returned flag instead of killing the process, so
/// that [run_capture] can clean up the simulator.
pub fn install_interrupt_handler() -> Result<Arc<AtomicBool>, Error> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = flag.clone();
    ctrlc::set_handler(move || handler_flag.store(true, Ordering::SeqCst))?;
    Ok(flag)
}

fn check_interrupt(interrupt: &AtomicBool) -> Result<(), Error> {
    if interrupt.load(Ordering::SeqCst) {
        Err(Error::Interrupted)
    } else {
        Ok(())
    }
}

/// Spawn traffic and the ego vehicle into `session`. The ego vehicle only takes spawn points that
/// were not given to background vehicles.
fn spawn_vehicles<S: Simulator>(
    sim: &mut S,
    session: &mut CaptureSession<S::Vehicle, S::Camera>,
    config: &CaptureConfig,
    interrupt: &AtomicBool,
    rng: &mut impl Rng,
) -> Result<(), Error> {
    let blueprints = sim.vehicle_blueprints()?;
    if blueprints.is_empty() {
        return Err(Error::Simulator("no vehicle blueprints".to_string()));
    }
    let mut spawn_points = sim.spawn_points()?;
    spawn_points.shuffle(rng);

    let mut used = HashSet::new();
    for (i, sp) in spawn_points.iter().take(config.max_npcs).enumerate() {
        check_interrupt(interrupt)?;
        let bp = &blueprints[rng.gen_range(0, blueprints.len())];
        if let Some(v) = sim.try_spawn_vehicle(bp, sp)? {
            debug!("Spawned {} ({}) at spawn point {}", bp, v.id(), i);
            session.npcs.push(v);
            used.insert(i);
        }
    }
    info!("Spawned {} background vehicles", session.npcs.len());

    for (i, sp) in spawn_points.iter().enumerate() {
        if used.contains(&i) {
            continue;
        }
        check_interrupt(interrupt)?;
        let bp = &blueprints[rng.gen_range(0, blueprints.len())];
        if let Some(v) = sim.try_spawn_vehicle(bp, sp)? {
            info!("Spawned ego vehicle {} ({})", bp, v.id());
            session.ego = Some(v);
            return Ok(());
        }
    }
    Err(Error::NoSpawnPoint)
}

/// Run one capture session against `sim`.
///
/// Frames arrive from the simulator's callback through a channel; this thread is the only one
/// counting and saving them, so no more than the target number of images is written. Raising
/// `interrupt` ends the run early. All spawned actors are destroyed before this returns.
pub fn run_capture<S: Simulator>(
    sim: &mut S,
    config: &CaptureConfig,
    interrupt: &AtomicBool,
) -> Result<CaptureOutcome, Error> {
    std::fs::create_dir_all(&config.output_dir)?;
    let mut rng = rand::thread_rng();

    sim.load_world(&config.map)?;
    info!("Loaded map {}", config.map);

    let mut session = CaptureSession::new();
    spawn_vehicles(sim, &mut session, config, interrupt, &mut rng)?;

    let tm_port = sim.traffic_manager_port()?;
    for v in session.npcs.iter_mut() {
        v.set_autopilot(true, tm_port)?;
    }
    if let Some(ego) = session.ego.as_mut() {
        ego.set_autopilot(true, tm_port)?;
    }

    check_interrupt(interrupt)?;
    if let Some(ego) = session.ego.as_ref() {
        session.camera = Some(sim.spawn_camera(&config.camera, ego)?);
    }

    let (start, end) = config.target_range;
    let target = if end > start {
        rng.gen_range(start, end)
    } else {
        start
    };
    println!("Target image count: {}", target);

    let (tx, rx) = mpsc::channel();
    if let Some(camera) = session.camera.as_mut() {
        camera.listen(Box::new(move |image| {
            // the receiver is gone once the target is reached
            let _ = tx.send(image);
        }))?;
    }

    let pb = progress_bar(target as u64, "Capturing", config.verbose);
    let mut captured = 0;
    let mut interrupted = false;
    while captured < target {
        if interrupt.load(Ordering::SeqCst) {
            interrupted = true;
            break;
        }
        match rx.recv_timeout(config.poll_interval) {
            Ok(CapturedImage { frame, image }) => {
                image.save(frame_path(&config.output_dir, frame))?;
                captured += 1;
                pb.inc(1);
                println!("Captured image {}/{}", captured, target);
            }
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(Error::Simulator(
                    "camera stopped delivering images".to_string(),
                ))
            }
        }
    }
    pb.finish_and_clear();

    if interrupted {
        info!("Stopping early after {} images", captured);
    } else {
        info!("Reached target of {} images. Stopping.", target);
    }
    session.teardown();

    Ok(CaptureOutcome {
        target: target,
        captured: captured,
        interrupted: interrupted,
    })
}

#[cfg(test)]
mod fake {
    //! In-process stand-in for a simulator that records every call it receives.

    use super::*;
    use std::sync::Mutex;
    use std::thread::JoinHandle;

    pub type Log = Arc<Mutex<Vec<String>>>;

    pub struct FakeVehicle {
        pub id: u32,
        pub log: Log,
    }

    impl Actor for FakeVehicle {
        fn id(&self) -> u32 {
            self.id
        }

        fn destroy(&mut self) -> Result<(), Error> {
            self.log.lock().unwrap().push(format!("destroy {}", self.id));
            Ok(())
        }
    }

    impl Vehicle for FakeVehicle {
        fn set_autopilot(&mut self, enabled: bool, tm_port: u16) -> Result<(), Error> {
            assert!(enabled);
            assert_eq!(tm_port, 8000);
            self.log.lock().unwrap().push(format!("autopilot {}", self.id));
            Ok(())
        }
    }

    pub struct FakeCamera {
        pub id: u32,
        pub log: Log,
        /// Whether the camera produces frames at all.
        pub emit: bool,
        running: Arc<AtomicBool>,
        worker: Option<JoinHandle<()>>,
    }

    impl Actor for FakeCamera {
        fn id(&self) -> u32 {
            self.id
        }

        fn destroy(&mut self) -> Result<(), Error> {
            self.log.lock().unwrap().push(format!("destroy {}", self.id));
            Ok(())
        }
    }

    impl Sensor for FakeCamera {
        fn listen(
            &mut self,
            mut callback: Box<dyn FnMut(CapturedImage) + Send>,
        ) -> Result<(), Error> {
            self.log.lock().unwrap().push(format!("listen {}", self.id));
            if !self.emit {
                return Ok(());
            }
            self.running.store(true, Ordering::SeqCst);
            let running = self.running.clone();
            self.worker = Some(std::thread::spawn(move || {
                let mut frame = 100;
                while running.load(Ordering::SeqCst) {
                    callback(CapturedImage {
                        frame: frame,
                        image: RgbImage::new(2, 2),
                    });
                    frame += 1;
                    std::thread::sleep(Duration::from_millis(1));
                }
            }));
            Ok(())
        }

        fn stop(&mut self) -> Result<(), Error> {
            self.running.store(false, Ordering::SeqCst);
            if let Some(worker) = self.worker.take() {
                let _ = worker.join();
            }
            self.log.lock().unwrap().push(format!("stop {}", self.id));
            Ok(())
        }
    }

    pub struct FakeSimulator {
        pub log: Log,
        pub num_spawn_points: usize,
        /// Spawn points (by x coordinate) already taken by someone else.
        pub blocked: HashSet<i64>,
        pub emit: bool,
        /// Raise this flag once the given number of vehicles has been spawned.
        pub interrupt_after: Option<(u32, Arc<AtomicBool>)>,
        next_id: u32,
    }

    impl FakeSimulator {
        pub fn new(num_spawn_points: usize) -> Self {
            FakeSimulator {
                log: Arc::new(Mutex::new(Vec::new())),
                num_spawn_points: num_spawn_points,
                blocked: HashSet::new(),
                emit: true,
                interrupt_after: None,
                next_id: 1,
            }
        }

        pub fn entries(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    impl Simulator for FakeSimulator {
        type Vehicle = FakeVehicle;
        type Camera = FakeCamera;

        fn load_world(&mut self, map: &str) -> Result<(), Error> {
            self.log.lock().unwrap().push(format!("load {}", map));
            Ok(())
        }

        fn vehicle_blueprints(&self) -> Result<Vec<String>, Error> {
            Ok(vec!["vehicle.a".to_string(), "vehicle.b".to_string()])
        }

        fn spawn_points(&self) -> Result<Vec<Transform>, Error> {
            Ok((0..self.num_spawn_points)
                .map(|i| Transform::from_location(i as f64, 0.0, 0.0))
                .collect())
        }

        fn try_spawn_vehicle(
            &mut self,
            _blueprint: &str,
            at: &Transform,
        ) -> Result<Option<FakeVehicle>, Error> {
            let key = at.location.x as i64;
            if !self.blocked.insert(key) {
                return Ok(None);
            }
            let id = self.next_id;
            self.next_id += 1;
            self.log.lock().unwrap().push(format!("spawn {}", id));
            if let Some((n, flag)) = &self.interrupt_after {
                if id == *n {
                    flag.store(true, Ordering::SeqCst);
                }
            }
            Ok(Some(FakeVehicle {
                id: id,
                log: self.log.clone(),
            }))
        }

        fn traffic_manager_port(&mut self) -> Result<u16, Error> {
            Ok(8000)
        }

        fn spawn_camera(
            &mut self,
            spec: &CameraSpec,
            parent: &FakeVehicle,
        ) -> Result<FakeCamera, Error> {
            assert_eq!(spec.width, 4000);
            let id = self.next_id;
            self.next_id += 1;
            self.log
                .lock()
                .unwrap()
                .push(format!("camera {} on {}", id, parent.id));
            Ok(FakeCamera {
                id: id,
                log: self.log.clone(),
                emit: self.emit,
                running: Arc::new(AtomicBool::new(false)),
                worker: None,
            })
        }
    }
}

#[cfg(test)]
fn test_config(dir: &Path, target: usize, max_npcs: usize) -> CaptureConfig {
    CaptureConfig {
        max_npcs: max_npcs,
        output_dir: dir.to_path_buf(),
        target_range: (target, target + 1),
        poll_interval: Duration::from_millis(5),
        ..CaptureConfig::default()
    }
}

/// Check the tail of the log is the teardown of camera, ego, then the npcs, each exactly once.
#[cfg(test)]
fn assert_teardown(entries: &[String], camera: Option<u32>, ego: u32, npcs: &[u32]) {
    let mut expected = Vec::new();
    if let Some(c) = camera {
        expected.push(format!("stop {}", c));
        expected.push(format!("destroy {}", c));
    }
    expected.push(format!("destroy {}", ego));
    expected.extend(npcs.iter().map(|id| format!("destroy {}", id)));
    let tail = &entries[entries.len() - expected.len()..];
    assert_eq!(tail, &expected[..]);
    let destroys = entries.iter().filter(|e| e.starts_with("destroy")).count();
    assert_eq!(destroys, npcs.len() + 1 + camera.iter().count());
}

#[test]
fn test_capture_reaches_target() {
    let dir = tempfile::tempdir().unwrap();
    let mut sim = fake::FakeSimulator::new(10);
    let interrupt = AtomicBool::new(false);
    let outcome = run_capture(&mut sim, &test_config(dir.path(), 5, 9), &interrupt).unwrap();
    assert_eq!(
        outcome,
        CaptureOutcome {
            target: 5,
            captured: 5,
            interrupted: false
        }
    );

    // the camera keeps producing frames until it is stopped, only 5 may be saved
    let saved = std::fs::read_dir(dir.path()).unwrap().count();
    assert_eq!(saved, 5);
    assert!(frame_path(dir.path(), 100).exists());

    // 9 npcs (ids 1..=9), the ego takes one of the remaining spawn points (10), camera is 11
    let entries = sim.entries();
    assert_eq!(entries[0], "load Town10HD_Opt");
    assert!(entries.contains(&"camera 11 on 10".to_string()));
    let npcs = (1..=9).collect::<Vec<_>>();
    assert_teardown(&entries, Some(11), 10, &npcs);
}

#[test]
fn test_npcs_capped() {
    let dir = tempfile::tempdir().unwrap();
    let mut sim = fake::FakeSimulator::new(80);
    let interrupt = AtomicBool::new(false);
    run_capture(&mut sim, &test_config(dir.path(), 1, 50), &interrupt).unwrap();
    let entries = sim.entries();
    let spawned = entries.iter().filter(|e| e.starts_with("spawn")).count();
    let autopilot = entries.iter().filter(|e| e.starts_with("autopilot")).count();
    assert_eq!(spawned, 51);
    assert_eq!(autopilot, 51);
}

#[test]
fn test_capture_interrupted() {
    let dir = tempfile::tempdir().unwrap();
    let mut sim = fake::FakeSimulator::new(4);
    sim.emit = false;
    let interrupt = Arc::new(AtomicBool::new(false));
    let flag = interrupt.clone();
    let raiser = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(200));
        flag.store(true, Ordering::SeqCst);
    });

    let outcome = run_capture(&mut sim, &test_config(dir.path(), 3, 3), &interrupt).unwrap();
    raiser.join().unwrap();
    assert!(outcome.interrupted);
    assert_eq!(outcome.captured, 0);
    assert_teardown(&sim.entries(), Some(5), 4, &[1, 2, 3]);
}

#[test]
fn test_interrupt_before_spawning() {
    let dir = tempfile::tempdir().unwrap();
    let mut sim = fake::FakeSimulator::new(4);
    let interrupt = AtomicBool::new(true);
    match run_capture(&mut sim, &test_config(dir.path(), 3, 50), &interrupt) {
        Err(Error::Interrupted) => (),
        other => panic!("expected interruption, got {:?}", other),
    }
    assert!(sim.entries().iter().all(|e| !e.starts_with("spawn")));
}

#[test]
fn test_interrupt_during_spawning() {
    let dir = tempfile::tempdir().unwrap();
    let mut sim = fake::FakeSimulator::new(10);
    let interrupt = Arc::new(AtomicBool::new(false));
    sim.interrupt_after = Some((3, interrupt.clone()));
    match run_capture(&mut sim, &test_config(dir.path(), 3, 50), &interrupt) {
        Err(Error::Interrupted) => (),
        other => panic!("expected interruption, got {:?}", other),
    }
    let entries = sim.entries();
    assert!(entries.iter().all(|e| !e.starts_with("camera")));
    let destroyed = entries
        .iter()
        .filter(|e| e.starts_with("destroy"))
        .cloned()
        .collect::<Vec<_>>();
    assert_eq!(destroyed, vec!["destroy 1", "destroy 2", "destroy 3"]);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn test_no_spawn_point_for_ego() {
    let dir = tempfile::tempdir().unwrap();
    let mut sim = fake::FakeSimulator::new(3);
    let interrupt = AtomicBool::new(false);
    match run_capture(&mut sim, &test_config(dir.path(), 3, 50), &interrupt) {
        Err(Error::NoSpawnPoint) => (),
        other => panic!("expected no spawn point, got {:?}", other),
    }
    let entries = sim.entries();
    assert!(entries.iter().all(|e| !e.starts_with("camera")));
    let destroyed = entries
        .iter()
        .filter(|e| e.starts_with("destroy"))
        .cloned()
        .collect::<Vec<_>>();
    assert_eq!(destroyed, vec!["destroy 1", "destroy 2", "destroy 3"]);
}

#[test]
fn test_ego_skips_blocked_spawn_points() {
    let dir = tempfile::tempdir().unwrap();
    let mut sim = fake::FakeSimulator::new(6);
    // two spots are occupied by something else, npcs take the other four after shuffling
    sim.blocked.insert(0);
    sim.blocked.insert(1);
    let interrupt = AtomicBool::new(false);
    match run_capture(&mut sim, &test_config(dir.path(), 1, 50), &interrupt) {
        Err(Error::NoSpawnPoint) => (),
        other => panic!("expected no spawn point, got {:?}", other),
    }
    assert_eq!(
        sim.entries()
            .iter()
            .filter(|e| e.starts_with("destroy"))
            .count(),
        4
    );
}

#[test]
fn test_camera_attributes() {
    let attrs = CameraSpec::default().attributes();
    assert_eq!(
        attrs,
        vec![
            ("image_size_x", "4000".to_string()),
            ("image_size_y", "3000".to_string()),
            ("fov", "110".to_string()),
            ("sensor_tick", "2".to_string()),
        ]
    );
    assert_eq!(
        frame_path(Path::new("out"), 42),
        PathBuf::from("out/000042.png")
    );
}
