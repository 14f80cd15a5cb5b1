//! [Simulator] implementation backed by a CARLA server.

extern crate carla_rs;

use carla_rs::client::{ActorBase, Client, Sensor as CarlaSensor, Vehicle as CarlaVehicle, World};
use carla_rs::geom::{Location, Rotation, Transform as CarlaTransform};
use carla_rs::rpc::AttachmentType;
use carla_rs::sensor::data::Image as CarlaImage;
use carla_rs::sensor::SensorDataBase;
use carla_rs::{CarlaError, OperationError};
use image::RgbImage;
use log::{debug, info};

use std::convert::TryFrom;
use std::time::Duration;

use crate::capture::{Actor, CameraSpec, CapturedImage, Sensor, Simulator, Transform, Vehicle};
use crate::Error;

fn simulator_error(e: CarlaError) -> Error {
    Error::Simulator(e.to_string())
}

pub struct CarlaSimulator {
    client: Client,
    world: World,
}

impl CarlaSimulator {
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, Error> {
        let mut client = Client::connect(host, port, None).map_err(simulator_error)?;
        client.set_timeout(timeout).map_err(simulator_error)?;
        let world = client.world().map_err(simulator_error)?;
        info!("Connected to CARLA at {}:{}", host, port);
        Ok(CarlaSimulator {
            client: client,
            world: world,
        })
    }
}

fn to_carla(t: &Transform) -> CarlaTransform {
    CarlaTransform {
        location: Location::new(
            t.location.x as f32,
            t.location.y as f32,
            t.location.z as f32,
        ),
        rotation: Rotation::new(t.pitch as f32, t.yaw as f32, t.roll as f32),
    }
}

fn from_carla(t: &CarlaTransform) -> Transform {
    let mut out = Transform::from_location(
        t.location.x as f64,
        t.location.y as f64,
        t.location.z as f64,
    );
    out.pitch = t.rotation.pitch as f64;
    out.yaw = t.rotation.yaw as f64;
    out.roll = t.rotation.roll as f64;
    out
}

/// Convert a BGRA camera frame to RGB.
fn to_rgb(image: &CarlaImage) -> RgbImage {
    let width = image.width() as u32;
    let height = image.height() as u32;
    let mut rgb = RgbImage::new(width, height);
    for (px, c) in rgb.pixels_mut().zip(image.as_slice().iter()) {
        *px = image::Rgb([c.r, c.g, c.b]);
    }
    rgb
}

/// Destroy `actor`, treating "already gone" as an error so teardown gets logged.
fn destroy_actor<A: ActorBase>(actor: &A, kind: &str) -> Result<(), Error> {
    if actor.destroy().map_err(simulator_error)? {
        Ok(())
    } else {
        Err(Error::Simulator(format!(
            "{} {} was not destroyed",
            kind,
            actor.id()
        )))
    }
}

pub struct CarlaVehicleActor(CarlaVehicle);

impl Actor for CarlaVehicleActor {
    fn id(&self) -> u32 {
        self.0.id()
    }

    fn destroy(&mut self) -> Result<(), Error> {
        destroy_actor(&self.0, "vehicle")
    }
}

impl Vehicle for CarlaVehicleActor {
    fn set_autopilot(&mut self, enabled: bool, tm_port: u16) -> Result<(), Error> {
        self.0
            .set_autopilot_opt(enabled, tm_port)
            .map_err(simulator_error)
    }
}

pub struct CarlaCamera(CarlaSensor);

impl Actor for CarlaCamera {
    fn id(&self) -> u32 {
        self.0.id()
    }

    fn destroy(&mut self) -> Result<(), Error> {
        destroy_actor(&self.0, "camera")
    }
}

impl Sensor for CarlaCamera {
    fn listen(&mut self, mut callback: Box<dyn FnMut(CapturedImage) + Send>) -> Result<(), Error> {
        self.0
            .listen(move |data| {
                let frame = data.frame() as u64;
                match CarlaImage::try_from(data) {
                    Ok(image) => callback(CapturedImage {
                        frame: frame,
                        image: to_rgb(&image),
                    }),
                    Err(_) => debug!("Ignoring non image data at frame {}", frame),
                }
            })
            .map_err(simulator_error)
    }

    fn stop(&mut self) -> Result<(), Error> {
        self.0.stop().map_err(simulator_error)
    }
}

impl Simulator for CarlaSimulator {
    type Vehicle = CarlaVehicleActor;
    type Camera = CarlaCamera;

    fn load_world(&mut self, map: &str) -> Result<(), Error> {
        self.world = self.client.load_world(map).map_err(simulator_error)?;
        Ok(())
    }

    fn vehicle_blueprints(&self) -> Result<Vec<String>, Error> {
        let library = self
            .world
            .blueprint_library()
            .and_then(|lib| lib.filter("*vehicle*"))
            .map_err(simulator_error)?;
        Ok(library.iter().map(|bp| bp.id()).collect())
    }

    fn spawn_points(&self) -> Result<Vec<Transform>, Error> {
        let points = self
            .world
            .map()
            .and_then(|map| map.recommended_spawn_points())
            .map_err(simulator_error)?;
        Ok(points.iter().map(from_carla).collect())
    }

    fn try_spawn_vehicle(
        &mut self,
        blueprint: &str,
        at: &Transform,
    ) -> Result<Option<CarlaVehicleActor>, Error> {
        let bp = self
            .world
            .blueprint_library()
            .and_then(|lib| lib.find(blueprint))
            .map_err(simulator_error)?
            .ok_or_else(|| Error::Simulator(format!("unknown blueprint {}", blueprint)))?;
        let actor = match self.world.spawn_actor(&bp, &to_carla(at)) {
            Ok(actor) => actor,
            // the spot is occupied
            Err(CarlaError::Operation(OperationError::SpawnFailed { reason, .. })) => {
                debug!("Could not spawn {}: {}", blueprint, reason);
                return Ok(None);
            }
            Err(e) => return Err(simulator_error(e)),
        };
        CarlaVehicle::try_from(actor)
            .map(|v| Some(CarlaVehicleActor(v)))
            .map_err(|_| Error::Simulator(format!("{} is not a vehicle", blueprint)))
    }

    fn traffic_manager_port(&mut self) -> Result<u16, Error> {
        let tm = self.client.instance_tm(None).map_err(simulator_error)?;
        Ok(tm.port())
    }

    fn spawn_camera(
        &mut self,
        spec: &CameraSpec,
        parent: &CarlaVehicleActor,
    ) -> Result<CarlaCamera, Error> {
        let mut bp = self
            .world
            .blueprint_library()
            .and_then(|lib| lib.find(&spec.blueprint))
            .map_err(simulator_error)?
            .ok_or_else(|| Error::Simulator(format!("unknown blueprint {}", spec.blueprint)))?;
        for (key, value) in spec.attributes() {
            if !bp.set_attribute(key, &value) {
                return Err(Error::Simulator(format!(
                    "cannot set {}={} on {}",
                    key, value, spec.blueprint
                )));
            }
        }
        let actor = self
            .world
            .spawn_actor_attached(&bp, &to_carla(&spec.mount), &parent.0, AttachmentType::Rigid)
            .map_err(simulator_error)?;
        CarlaSensor::try_from(actor)
            .map(CarlaCamera)
            .map_err(|_| Error::Simulator(format!("{} is not a sensor", spec.blueprint)))
    }
}
