//! # Physics Policy Layer
//!
//! The rigid-body engine itself is an external collaborator. This module
//! owns the seam: the [`PhysicsScene`] trait is everything the character
//! controller and server-side apps are allowed to ask of it, and
//! [`AnalyticScene`] is a small analytic implementation (ground patches +
//! boxes) that backs headless servers and the test suite.
//!
//! Scene state is mutated only in the fixed phase.

use atrium_shared::{Transform, Vec3};

// ============================================================================
// LAYERS & MATERIALS
// ============================================================================

/// Collision layer bitmask.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LayerMask(pub u32);

impl LayerMask {
    /// Static world geometry.
    pub const ENVIRONMENT: Self = Self(1 << 0);
    /// App-owned props.
    pub const PROP: Self = Self(1 << 1);
    /// Held tools.
    pub const TOOL: Self = Self(1 << 2);
    /// Player capsules.
    pub const PLAYER: Self = Self(1 << 3);

    /// The mask the ground sweep uses: everything a player can stand on.
    pub const WALKABLE: Self = Self(Self::ENVIRONMENT.0 | Self::PROP.0 | Self::TOOL.0);

    /// True when the masks share a layer.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

/// Friction/restitution combine mode for the capsule material.
///
/// `Min` while airborne (zero-friction against walls), `Max` while grounded
/// (absorb platform friction so pushed objects carry the player).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CombineMode {
    /// Take the smaller coefficient of the pair.
    Min,
    /// Take the larger coefficient of the pair.
    Max,
}

// ============================================================================
// SCENE SEAM
// ============================================================================

/// Handle to a body owned by the physics scene.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BodyId(pub u32);

/// Result of a downward sphere sweep.
#[derive(Clone, Copy, Debug)]
pub struct SweepHit {
    /// Contact point.
    pub point: Vec3,
    /// Surface normal at the contact.
    pub normal: Vec3,
    /// Swept distance to the contact.
    pub distance: f32,
    /// The body that was hit, when the surface belongs to one.
    pub actor: Option<BodyId>,
}

/// Result of a raycast.
#[derive(Clone, Copy, Debug)]
pub struct RayHit {
    /// Contact point.
    pub point: Vec3,
    /// Surface normal at the contact.
    pub normal: Vec3,
    /// Ray distance to the contact.
    pub distance: f32,
    /// The body that was hit, when the surface belongs to one.
    pub actor: Option<BodyId>,
}

/// What a body is to the solver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyMotion {
    /// Immovable.
    Static,
    /// Driven by poses, pushes others, is not pushed.
    Kinematic,
    /// Integrated from forces.
    Dynamic,
}

/// Shape of a body.
#[derive(Clone, Copy, Debug)]
pub enum BodyShape {
    /// Vertical capsule: radius + end-to-end height, origin at the feet.
    Capsule {
        /// Capsule radius.
        radius: f32,
        /// End-to-end height.
        height: f32,
    },
    /// Axis-aligned box: half extents, origin at the center.
    Box {
        /// Half extents.
        half: Vec3,
    },
}

/// The narrow surface the world asks of the rigid-body collaborator.
pub trait PhysicsScene {
    /// Adds a body; returns its handle.
    fn add_body(&mut self, shape: BodyShape, motion: BodyMotion, mass: f32, layer: LayerMask, transform: Transform) -> BodyId;

    /// Removes a body. Unknown handles are ignored.
    fn remove_body(&mut self, body: BodyId);

    /// Body pose, if the body exists.
    fn body_transform(&self, body: BodyId) -> Option<Transform>;

    /// Sets a body pose directly (kinematic drive or teleport).
    fn set_body_transform(&mut self, body: BodyId, transform: Transform);

    /// Linear velocity.
    fn body_velocity(&self, body: BodyId) -> Option<Vec3>;

    /// Overrides linear velocity.
    fn set_body_velocity(&mut self, body: BodyId, velocity: Vec3);

    /// Accumulates a force for the next step.
    fn apply_force(&mut self, body: BodyId, force: Vec3);

    /// Accumulates an impulse for the next step.
    fn apply_impulse(&mut self, body: BodyId, impulse: Vec3);

    /// Enables or disables scene gravity for one body.
    fn set_gravity_enabled(&mut self, body: BodyId, enabled: bool);

    /// Sets the capsule material combine mode.
    fn set_material_mode(&mut self, body: BodyId, mode: CombineMode);

    /// True when the handle names a dynamic body.
    fn is_dynamic(&self, body: BodyId) -> bool;

    /// Sweeps a sphere straight down.
    fn sweep_sphere_down(&self, origin: Vec3, radius: f32, max_distance: f32, mask: LayerMask, ignore: Option<BodyId>) -> Option<SweepHit>;

    /// Casts a ray.
    fn raycast(&self, origin: Vec3, direction: Vec3, max_distance: f32, mask: LayerMask, ignore: Option<BodyId>) -> Option<RayHit>;

    /// Integrates one fixed step.
    fn step(&mut self, dt: f32);
}

// ============================================================================
// ANALYTIC SCENE
// ============================================================================

/// A ground patch: a plane over an xz rectangle.
#[derive(Clone, Copy, Debug)]
struct GroundPatch {
    min_x: f32,
    max_x: f32,
    min_z: f32,
    max_z: f32,
    /// Height at the patch origin corner (min_x, min_z).
    base_height: f32,
    /// Rise per meter along +x.
    slope_x: f32,
    /// Rise per meter along +z.
    slope_z: f32,
}

impl GroundPatch {
    fn contains(&self, x: f32, z: f32) -> bool {
        x >= self.min_x && x <= self.max_x && z >= self.min_z && z <= self.max_z
    }

    fn height_at(&self, x: f32, z: f32) -> f32 {
        self.base_height + (x - self.min_x) * self.slope_x + (z - self.min_z) * self.slope_z
    }

    fn normal(&self) -> Vec3 {
        Vec3::new(-self.slope_x, 1.0, -self.slope_z).normalized()
    }
}

struct Body {
    shape: BodyShape,
    motion: BodyMotion,
    mass: f32,
    layer: LayerMask,
    transform: Transform,
    velocity: Vec3,
    gravity_enabled: bool,
    #[allow(dead_code)]
    material: CombineMode,
    force_accum: Vec3,
    impulse_accum: Vec3,
    alive: bool,
}

/// Analytic scene: an infinite flat floor at y = 0, optional sloped ground
/// patches, and simple box/capsule bodies. Enough physics for a headless
/// server and for the controller tests; a real deployment plugs a rigid-body
/// engine into [`PhysicsScene`] instead.
pub struct AnalyticScene {
    gravity: f32,
    bodies: Vec<Body>,
    patches: Vec<GroundPatch>,
    floor_enabled: bool,
}

impl AnalyticScene {
    /// Creates a scene with the flat floor enabled.
    #[must_use]
    pub fn new(gravity: f32) -> Self {
        Self {
            gravity,
            bodies: Vec::new(),
            patches: Vec::new(),
            floor_enabled: true,
        }
    }

    /// Disables the infinite floor (fall-forever worlds).
    pub fn set_floor_enabled(&mut self, enabled: bool) {
        self.floor_enabled = enabled;
    }

    /// Adds a sloped ground patch over `[min_x..max_x] x [min_z..max_z]`.
    pub fn add_slope(&mut self, min_x: f32, max_x: f32, min_z: f32, max_z: f32, base_height: f32, slope_x: f32, slope_z: f32) {
        self.patches.push(GroundPatch {
            min_x,
            max_x,
            min_z,
            max_z,
            base_height,
            slope_x,
            slope_z,
        });
    }

    fn body(&self, id: BodyId) -> Option<&Body> {
        self.bodies.get(id.0 as usize).filter(|b| b.alive)
    }

    fn body_mut(&mut self, id: BodyId) -> Option<&mut Body> {
        self.bodies.get_mut(id.0 as usize).filter(|b| b.alive)
    }

    /// Highest walkable surface under (x, z), excluding `ignore`.
    fn surface_under(&self, x: f32, z: f32, mask: LayerMask, ignore: Option<BodyId>) -> Option<(f32, Vec3, Option<BodyId>)> {
        let mut best: Option<(f32, Vec3, Option<BodyId>)> = None;

        if self.floor_enabled && LayerMask::ENVIRONMENT.intersects(mask) {
            best = Some((0.0, Vec3::UP, None));
        }

        if LayerMask::ENVIRONMENT.intersects(mask) {
            for patch in &self.patches {
                if patch.contains(x, z) {
                    let h = patch.height_at(x, z);
                    if best.map_or(true, |(bh, _, _)| h > bh) {
                        best = Some((h, patch.normal(), None));
                    }
                }
            }
        }

        for (index, body) in self.bodies.iter().enumerate() {
            if !body.alive || Some(BodyId(index as u32)) == ignore {
                continue;
            }
            if !body.layer.intersects(mask) {
                continue;
            }
            if let BodyShape::Box { half } = body.shape {
                let center = body.transform.position;
                let sx = half.x * body.transform.scale.x;
                let sz = half.z * body.transform.scale.z;
                if (x - center.x).abs() <= sx && (z - center.z).abs() <= sz {
                    let top = center.y + half.y * body.transform.scale.y;
                    if best.map_or(true, |(bh, _, _)| top > bh) {
                        best = Some((top, Vec3::UP, Some(BodyId(index as u32))));
                    }
                }
            }
        }

        best
    }

    fn bottom_of(body: &Body) -> f32 {
        match body.shape {
            BodyShape::Capsule { .. } => body.transform.position.y,
            BodyShape::Box { half } => body.transform.position.y - half.y * body.transform.scale.y,
        }
    }
}

impl PhysicsScene for AnalyticScene {
    fn add_body(&mut self, shape: BodyShape, motion: BodyMotion, mass: f32, layer: LayerMask, transform: Transform) -> BodyId {
        let id = BodyId(self.bodies.len() as u32);
        self.bodies.push(Body {
            shape,
            motion,
            mass: mass.max(1e-3),
            layer,
            transform,
            velocity: Vec3::ZERO,
            gravity_enabled: motion == BodyMotion::Dynamic,
            material: CombineMode::Min,
            force_accum: Vec3::ZERO,
            impulse_accum: Vec3::ZERO,
            alive: true,
        });
        id
    }

    fn remove_body(&mut self, body: BodyId) {
        if let Some(b) = self.bodies.get_mut(body.0 as usize) {
            b.alive = false;
        }
    }

    fn body_transform(&self, body: BodyId) -> Option<Transform> {
        self.body(body).map(|b| b.transform)
    }

    fn set_body_transform(&mut self, body: BodyId, transform: Transform) {
        if let Some(b) = self.body_mut(body) {
            b.transform = transform;
        }
    }

    fn body_velocity(&self, body: BodyId) -> Option<Vec3> {
        self.body(body).map(|b| b.velocity)
    }

    fn set_body_velocity(&mut self, body: BodyId, velocity: Vec3) {
        if let Some(b) = self.body_mut(body) {
            b.velocity = velocity;
        }
    }

    fn apply_force(&mut self, body: BodyId, force: Vec3) {
        if let Some(b) = self.body_mut(body) {
            b.force_accum += force;
        }
    }

    fn apply_impulse(&mut self, body: BodyId, impulse: Vec3) {
        if let Some(b) = self.body_mut(body) {
            b.impulse_accum += impulse;
        }
    }

    fn set_gravity_enabled(&mut self, body: BodyId, enabled: bool) {
        if let Some(b) = self.body_mut(body) {
            b.gravity_enabled = enabled;
        }
    }

    fn set_material_mode(&mut self, body: BodyId, mode: CombineMode) {
        if let Some(b) = self.body_mut(body) {
            b.material = mode;
        }
    }

    fn is_dynamic(&self, body: BodyId) -> bool {
        self.body(body).is_some_and(|b| b.motion == BodyMotion::Dynamic)
    }

    fn sweep_sphere_down(&self, origin: Vec3, radius: f32, max_distance: f32, mask: LayerMask, ignore: Option<BodyId>) -> Option<SweepHit> {
        let (height, normal, actor) = self.surface_under(origin.x, origin.z, mask, ignore)?;
        // Sphere center travels down until center - radius meets the surface.
        let travel = origin.y - radius - height;
        if travel > max_distance {
            return None;
        }
        Some(SweepHit {
            point: Vec3::new(origin.x, height, origin.z),
            normal,
            distance: travel.max(0.0),
            actor,
        })
    }

    fn raycast(&self, origin: Vec3, direction: Vec3, max_distance: f32, mask: LayerMask, ignore: Option<BodyId>) -> Option<RayHit> {
        let dir = direction.normalized();
        // The analytic scene only answers downward-leaning rays; that is
        // what the controller and the authoring cursor ask for.
        if dir.y >= -1e-3 {
            return None;
        }
        let (height, normal, actor) = self.surface_under(origin.x, origin.z, mask, ignore)?;
        let distance = (origin.y - height) / -dir.y;
        if !(0.0..=max_distance).contains(&distance) {
            return None;
        }
        Some(RayHit {
            point: origin + dir * distance,
            normal,
            distance,
            actor,
        })
    }

    fn step(&mut self, dt: f32) {
        let gravity = self.gravity;
        // Collect surfaces first: bodies cannot be queried while mutably
        // iterated.
        let supports: Vec<Option<(f32, Vec3, Option<BodyId>)>> = (0..self.bodies.len())
            .map(|i| {
                let body = &self.bodies[i];
                if !body.alive || body.motion != BodyMotion::Dynamic {
                    None
                } else {
                    self.surface_under(
                        body.transform.position.x,
                        body.transform.position.z,
                        LayerMask::WALKABLE,
                        Some(BodyId(i as u32)),
                    )
                }
            })
            .collect();

        for (index, body) in self.bodies.iter_mut().enumerate() {
            if !body.alive || body.motion != BodyMotion::Dynamic {
                body.force_accum = Vec3::ZERO;
                body.impulse_accum = Vec3::ZERO;
                continue;
            }
            let inv_mass = 1.0 / body.mass;
            let mut accel = body.force_accum * inv_mass;
            if body.gravity_enabled {
                accel.y -= gravity;
            }
            body.velocity += accel * dt + body.impulse_accum * inv_mass;
            body.transform.position += body.velocity * dt;
            body.force_accum = Vec3::ZERO;
            body.impulse_accum = Vec3::ZERO;

            // Resolve penetration against the highest support surface.
            if let Some((height, _, _)) = supports[index] {
                let bottom = Self::bottom_of(body);
                if bottom < height && body.velocity.y <= 0.0 {
                    let lift = height - bottom;
                    body.transform.position.y += lift;
                    body.velocity.y = 0.0;
                }
            }
        }
    }
}
