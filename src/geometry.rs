//! Geometry values consumed by the layer graph.
//!
//! These are immutable value types on the unit sphere: points, rotations and
//! the four geometry shapes features carry. Only the operations the graph and
//! its built-in strategies need are provided.

use std::borrow::Cow;
use std::f64::consts::PI;
use std::sync::Arc;

/// Mean Earth radius used to convert angular speeds to surface speeds.
pub const EARTH_RADIUS_KM: f64 = 6371.009;

const NUMERIC_TOLERANCE: f64 = 1e-12;

type Vec3 = [f64; 3];

fn dot(a: Vec3, b: Vec3) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn cross(a: Vec3, b: Vec3) -> Vec3 {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn scale(a: Vec3, k: f64) -> Vec3 {
    [a[0] * k, a[1] * k, a[2] * k]
}

fn add(a: Vec3, b: Vec3) -> Vec3 {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

fn sub(a: Vec3, b: Vec3) -> Vec3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn length(a: Vec3) -> f64 {
    dot(a, a).sqrt()
}

/// A point on the unit sphere.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UnitVector3 {
    x: f64,
    y: f64,
    z: f64,
}

impl UnitVector3 {
    /// The north pole.
    pub const NORTH_POLE: UnitVector3 = UnitVector3 {
        x: 0.0,
        y: 0.0,
        z: 1.0,
    };

    /// Normalise `(x, y, z)`; returns `None` for a zero-length vector.
    pub fn from_xyz(x: f64, y: f64, z: f64) -> Option<Self> {
        Self::from_array([x, y, z])
    }

    fn from_array(v: Vec3) -> Option<Self> {
        let len = length(v);
        if len <= NUMERIC_TOLERANCE || !len.is_finite() {
            return None;
        }
        Some(Self {
            x: v[0] / len,
            y: v[1] / len,
            z: v[2] / len,
        })
    }

    /// The point at `latitude`/`longitude` degrees.
    pub fn from_lat_lon(latitude: f64, longitude: f64) -> Self {
        let (lat, lon) = (latitude.to_radians(), longitude.to_radians());
        Self {
            x: lat.cos() * lon.cos(),
            y: lat.cos() * lon.sin(),
            z: lat.sin(),
        }
    }

    /// X component.
    pub fn x(&self) -> f64 {
        self.x
    }

    /// Y component.
    pub fn y(&self) -> f64 {
        self.y
    }

    /// Z component.
    pub fn z(&self) -> f64 {
        self.z
    }

    /// Components as an array.
    pub fn to_array(&self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }

    /// Dot product.
    pub fn dot(&self, other: &Self) -> f64 {
        dot(self.to_array(), other.to_array())
    }

    /// Angular distance to `other` in radians.
    pub fn angle_to(&self, other: &Self) -> f64 {
        let (a, b) = (self.to_array(), other.to_array());
        length(cross(a, b)).atan2(dot(a, b))
    }

    /// Latitude/longitude of this point.
    pub fn to_lat_lon(&self) -> LatLonPoint {
        LatLonPoint {
            latitude: self.z.clamp(-1.0, 1.0).asin().to_degrees(),
            longitude: self.y.atan2(self.x).to_degrees(),
        }
    }
}

/// A latitude/longitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LatLonPoint {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
}

impl LatLonPoint {
    /// Create a lat/lon point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// The corresponding point on the unit sphere.
    pub fn to_unit_vector(&self) -> UnitVector3 {
        UnitVector3::from_lat_lon(self.latitude, self.longitude)
    }
}

/// A finite rotation about the sphere's centre, stored as a unit quaternion.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Rotation {
    w: f64,
    x: f64,
    y: f64,
    z: f64,
}

impl Default for Rotation {
    fn default() -> Self {
        Self::identity()
    }
}

impl Rotation {
    /// The rotation that leaves every point in place.
    pub const fn identity() -> Self {
        Self {
            w: 1.0,
            x: 0.0,
            y: 0.0,
            z: 0.0,
        }
    }

    /// Rotation by `angle` radians (right-handed) about `axis`.
    pub fn from_axis_angle(axis: &UnitVector3, angle: f64) -> Self {
        let (sin, cos) = (angle * 0.5).sin_cos();
        Self {
            w: cos,
            x: axis.x * sin,
            y: axis.y * sin,
            z: axis.z * sin,
        }
    }

    /// Rotation by `angle_degrees` about the Euler pole at `pole`.
    pub fn from_euler_pole(pole: LatLonPoint, angle_degrees: f64) -> Self {
        Self::from_axis_angle(&pole.to_unit_vector(), angle_degrees.to_radians())
    }

    /// `self ∘ other`: applies `other` first, then `self`.
    #[must_use]
    pub fn compose(&self, other: &Rotation) -> Rotation {
        let (a, b) = (self, other);
        Rotation {
            w: a.w * b.w - a.x * b.x - a.y * b.y - a.z * b.z,
            x: a.w * b.x + a.x * b.w + a.y * b.z - a.z * b.y,
            y: a.w * b.y - a.x * b.z + a.y * b.w + a.z * b.x,
            z: a.w * b.z + a.x * b.y - a.y * b.x + a.z * b.w,
        }
        .normalized()
    }

    /// The reverse rotation.
    #[must_use]
    pub fn inverse(&self) -> Rotation {
        Rotation {
            w: self.w,
            x: -self.x,
            y: -self.y,
            z: -self.z,
        }
    }

    fn normalized(self) -> Rotation {
        let len = (self.w * self.w + self.x * self.x + self.y * self.y + self.z * self.z).sqrt();
        if len <= NUMERIC_TOLERANCE {
            return Rotation::identity();
        }
        Rotation {
            w: self.w / len,
            x: self.x / len,
            y: self.y / len,
            z: self.z / len,
        }
    }

    /// Rotate a point.
    pub fn rotate(&self, point: &UnitVector3) -> UnitVector3 {
        let q = [self.x, self.y, self.z];
        let v = point.to_array();
        let t = scale(cross(q, v), 2.0);
        let rotated = add(add(v, scale(t, self.w)), cross(q, t));
        UnitVector3::from_array(rotated).unwrap_or(*point)
    }

    /// Rotation angle in radians, in `[0, π]`.
    pub fn angle(&self) -> f64 {
        2.0 * self.w.abs().clamp(0.0, 1.0).acos()
    }

    /// Rotation axis, or `None` for the identity.
    pub fn axis(&self) -> Option<UnitVector3> {
        let axis = if self.w < 0.0 {
            [-self.x, -self.y, -self.z]
        } else {
            [self.x, self.y, self.z]
        };
        UnitVector3::from_array(axis)
    }

    /// Spherical linear interpolation from `self` (`t = 0`) to `other` (`t = 1`).
    #[must_use]
    pub fn interpolate(&self, other: &Rotation, t: f64) -> Rotation {
        let mut cos = self.w * other.w + self.x * other.x + self.y * other.y + self.z * other.z;
        let mut end = *other;
        if cos < 0.0 {
            cos = -cos;
            end = Rotation {
                w: -end.w,
                x: -end.x,
                y: -end.y,
                z: -end.z,
            };
        }
        let (k0, k1) = if cos > 1.0 - 1e-9 {
            (1.0 - t, t)
        } else {
            let theta = cos.clamp(-1.0, 1.0).acos();
            let sin = theta.sin();
            (((1.0 - t) * theta).sin() / sin, (t * theta).sin() / sin)
        };
        Rotation {
            w: k0 * self.w + k1 * end.w,
            x: k0 * self.x + k1 * end.x,
            y: k0 * self.y + k1 * end.y,
            z: k0 * self.z + k1 * end.z,
        }
        .normalized()
    }

    /// Returns true if both rotations move every point to within `tolerance` radians.
    pub fn approx_eq(&self, other: &Rotation, tolerance: f64) -> bool {
        self.inverse().compose(other).angle() <= tolerance
    }
}

/// A small circle bounding region: every point within `angular_radius` of `centre`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingSmallCircle {
    centre: UnitVector3,
    angular_radius: f64,
}

impl BoundingSmallCircle {
    /// Create a region of `angular_radius` radians around `centre`.
    pub fn new(centre: UnitVector3, angular_radius: f64) -> Self {
        Self {
            centre,
            angular_radius: angular_radius.clamp(0.0, PI),
        }
    }

    /// Centre of the circle.
    pub fn centre(&self) -> &UnitVector3 {
        &self.centre
    }

    /// Radius in radians.
    pub fn angular_radius(&self) -> f64 {
        self.angular_radius
    }

    /// Returns true if `point` lies inside or on the circle.
    pub fn contains_point(&self, point: &UnitVector3) -> bool {
        self.centre.angle_to(point) <= self.angular_radius + NUMERIC_TOLERANCE
    }

    /// Returns true if the two regions share at least one point.
    pub fn intersects(&self, other: &BoundingSmallCircle) -> bool {
        self.centre.angle_to(&other.centre)
            <= self.angular_radius + other.angular_radius + NUMERIC_TOLERANCE
    }

    /// Returns true if `other` lies entirely inside this circle.
    pub fn contains_circle(&self, other: &BoundingSmallCircle) -> bool {
        self.centre.angle_to(&other.centre) + other.angular_radius
            <= self.angular_radius + NUMERIC_TOLERANCE
    }

    /// Angular distance from `point` to the region (zero inside).
    pub fn distance_to(&self, point: &UnitVector3) -> f64 {
        (self.centre.angle_to(point) - self.angular_radius).max(0.0)
    }

    /// The same circle moved by `rotation`.
    #[must_use]
    pub fn rotated(&self, rotation: &Rotation) -> Self {
        Self {
            centre: rotation.rotate(&self.centre),
            angular_radius: self.angular_radius,
        }
    }
}

/// Feature geometry on the unit sphere.
///
/// Polygon rings are implicitly closed and must fit within a hemisphere.
#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    /// A single point.
    Point(UnitVector3),
    /// An unordered set of points.
    MultiPoint(Vec<UnitVector3>),
    /// Points joined by great-circle arcs.
    Polyline(Vec<UnitVector3>),
    /// A closed ring of great-circle arcs and its interior.
    Polygon(Vec<UnitVector3>),
}

impl Geometry {
    /// The vertices of this geometry.
    pub fn points(&self) -> &[UnitVector3] {
        match self {
            Geometry::Point(point) => std::slice::from_ref(point),
            Geometry::MultiPoint(points) | Geometry::Polyline(points) | Geometry::Polygon(points) => {
                points
            }
        }
    }

    /// A geometry of the same shape with its vertices replaced.
    ///
    /// For a point, only the first of `points` is used.
    #[must_use]
    pub fn with_points(&self, points: Vec<UnitVector3>) -> Geometry {
        match self {
            Geometry::Point(original) => Geometry::Point(points.first().copied().unwrap_or(*original)),
            Geometry::MultiPoint(_) => Geometry::MultiPoint(points),
            Geometry::Polyline(_) => Geometry::Polyline(points),
            Geometry::Polygon(_) => Geometry::Polygon(points),
        }
    }

    /// This geometry moved by `rotation`.
    #[must_use]
    pub fn rotated(&self, rotation: &Rotation) -> Geometry {
        self.with_points(self.points().iter().map(|p| rotation.rotate(p)).collect())
    }

    /// Normalised mean of the vertices.
    pub fn centroid(&self) -> UnitVector3 {
        let points = self.points();
        let sum = points
            .iter()
            .fold([0.0; 3], |acc, p| add(acc, p.to_array()));
        UnitVector3::from_array(sum)
            .or_else(|| points.first().copied())
            .unwrap_or(UnitVector3::NORTH_POLE)
    }

    /// A small circle containing the whole geometry.
    pub fn bounding_small_circle(&self) -> BoundingSmallCircle {
        let centre = self.centroid();
        let radius = self
            .points()
            .iter()
            .map(|p| centre.angle_to(p))
            .fold(0.0, f64::max);
        // Arcs only stay inside caps no larger than a hemisphere.
        let radius = match self {
            Geometry::Polyline(_) | Geometry::Polygon(_) if radius >= PI / 2.0 => PI,
            _ => radius,
        };
        BoundingSmallCircle::new(centre, radius)
    }

    fn arcs(&self) -> impl Iterator<Item = (&UnitVector3, &UnitVector3)> + '_ {
        let points = self.points();
        let closing = match self {
            Geometry::Polygon(ring) if ring.len() > 2 => ring.last().zip(ring.first()),
            _ => None,
        };
        points.windows(2).map(|w| (&w[0], &w[1])).chain(closing)
    }

    /// Returns true if this polygon contains `point` (always false for other shapes).
    pub fn contains_point(&self, point: &UnitVector3) -> bool {
        let Geometry::Polygon(ring) = self else {
            return false;
        };
        if ring.len() < 3 || !self.bounding_small_circle().contains_point(point) {
            return false;
        }
        let p = point.to_array();
        let mut winding = 0.0;
        for (a, b) in self.arcs() {
            let (a, b) = (a.to_array(), b.to_array());
            let ta = sub(a, scale(p, dot(a, p)));
            let tb = sub(b, scale(p, dot(b, p)));
            if length(ta) <= NUMERIC_TOLERANCE || length(tb) <= NUMERIC_TOLERANCE {
                // On a vertex.
                return true;
            }
            winding += dot(p, cross(ta, tb)).atan2(dot(ta, tb));
        }
        winding.abs() > PI
    }

    /// Angular distance from `point` to this geometry (zero inside a polygon).
    pub fn distance_to(&self, point: &UnitVector3) -> f64 {
        match self {
            Geometry::Point(p) => p.angle_to(point),
            Geometry::MultiPoint(points) => points
                .iter()
                .map(|p| p.angle_to(point))
                .fold(f64::INFINITY, f64::min),
            Geometry::Polyline(points) | Geometry::Polygon(points) => {
                if self.contains_point(point) {
                    return 0.0;
                }
                if points.len() == 1 {
                    return points[0].angle_to(point);
                }
                self.arcs()
                    .map(|(a, b)| distance_to_arc(point, a, b))
                    .fold(f64::INFINITY, f64::min)
            }
        }
    }

    /// Returns true if any part of this geometry lies inside `region`.
    pub fn intersects(&self, region: &BoundingSmallCircle) -> bool {
        self.distance_to(region.centre()) <= region.angular_radius() + NUMERIC_TOLERANCE
    }
}

/// Angular distance from `p` to the minor great-circle arc `a`–`b`.
fn distance_to_arc(p: &UnitVector3, a: &UnitVector3, b: &UnitVector3) -> f64 {
    let endpoints = p.angle_to(a).min(p.angle_to(b));
    let normal = cross(a.to_array(), b.to_array());
    let normal_len = length(normal);
    if normal_len <= NUMERIC_TOLERANCE {
        return endpoints;
    }
    let n = scale(normal, 1.0 / normal_len);
    let pv = p.to_array();
    let Some(foot) = UnitVector3::from_array(sub(pv, scale(n, dot(pv, n)))) else {
        return endpoints;
    };
    let f = foot.to_array();
    let within_arc = dot(cross(a.to_array(), f), n) >= 0.0 && dot(cross(f, b.to_array()), n) >= 0.0;
    if within_arc {
        p.angle_to(&foot).min(endpoints)
    } else {
        endpoints
    }
}

/// A geometry whose final position may not have been computed yet.
///
/// Rigidly rotated features keep their present-day geometry and the rotation,
/// and only apply the rotation when a consumer actually looks at the vertices.
#[derive(Debug, Clone, PartialEq)]
pub enum DeferredGeometry {
    /// Present-day geometry still to be moved by `rotation`.
    Rotated {
        /// Geometry at present day.
        present_day: Arc<Geometry>,
        /// Rotation to the reconstruction time.
        rotation: Rotation,
    },
    /// Geometry already at its final position.
    Resolved(Arc<Geometry>),
}

impl DeferredGeometry {
    /// The geometry at its final position, rotating on demand.
    pub fn geometry(&self) -> Cow<'_, Geometry> {
        match self {
            DeferredGeometry::Rotated {
                present_day,
                rotation,
            } => Cow::Owned(present_day.rotated(rotation)),
            DeferredGeometry::Resolved(geometry) => Cow::Borrowed(geometry),
        }
    }

    /// A bounding circle of the final geometry, without rotating the vertices.
    pub fn bounding_small_circle(&self) -> BoundingSmallCircle {
        match self {
            DeferredGeometry::Rotated {
                present_day,
                rotation,
            } => present_day.bounding_small_circle().rotated(rotation),
            DeferredGeometry::Resolved(geometry) => geometry.bounding_small_circle(),
        }
    }
}

impl From<Geometry> for DeferredGeometry {
    fn from(geometry: Geometry) -> Self {
        DeferredGeometry::Resolved(Arc::new(geometry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOL: f64 = 1e-9;

    fn ll(lat: f64, lon: f64) -> UnitVector3 {
        UnitVector3::from_lat_lon(lat, lon)
    }

    #[test]
    fn test_rotation_about_pole_moves_longitude() {
        let rotation = Rotation::from_euler_pole(LatLonPoint::new(90.0, 0.0), 30.0);
        let moved = rotation.rotate(&ll(0.0, 10.0)).to_lat_lon();
        assert!((moved.latitude).abs() < TOL);
        assert!((moved.longitude - 40.0).abs() < TOL);
    }

    #[test]
    fn test_compose_and_inverse() {
        let a = Rotation::from_euler_pole(LatLonPoint::new(10.0, 20.0), 15.0);
        let b = Rotation::from_euler_pole(LatLonPoint::new(-40.0, 100.0), 25.0);
        let p = ll(5.0, 5.0);

        let composed = a.compose(&b).rotate(&p);
        let sequential = a.rotate(&b.rotate(&p));
        assert!(composed.angle_to(&sequential) < TOL);

        let back = a.inverse().rotate(&a.rotate(&p));
        assert!(back.angle_to(&p) < TOL);
        assert!(a.compose(&a.inverse()).approx_eq(&Rotation::identity(), TOL));
    }

    #[test]
    fn test_interpolate_halfway() {
        let pole = LatLonPoint::new(0.0, 0.0);
        let a = Rotation::from_euler_pole(pole, 10.0);
        let b = Rotation::from_euler_pole(pole, 30.0);
        let half = a.interpolate(&b, 0.5);
        assert!(half.approx_eq(&Rotation::from_euler_pole(pole, 20.0), 1e-9));
    }

    #[test]
    fn test_polygon_contains_point() {
        let square = Geometry::Polygon(vec![ll(-10.0, -10.0), ll(-10.0, 10.0), ll(10.0, 10.0), ll(10.0, -10.0)]);
        assert!(square.contains_point(&ll(0.0, 0.0)));
        assert!(square.contains_point(&ll(9.0, -9.0)));
        assert!(!square.contains_point(&ll(0.0, 20.0)));
        // The antipode of the interior is outside.
        assert!(!square.contains_point(&ll(0.0, 180.0)));
    }

    #[test]
    fn test_polyline_distance_uses_arc_interior() {
        let line = Geometry::Polyline(vec![ll(0.0, -20.0), ll(0.0, 20.0)]);
        let distance = line.distance_to(&ll(5.0, 0.0));
        assert!((distance - 5f64.to_radians()).abs() < 1e-9);

        let beyond = line.distance_to(&ll(0.0, 30.0));
        assert!((beyond - 10f64.to_radians()).abs() < 1e-9);
    }

    #[test]
    fn test_deferred_bounds_match_rotated_geometry() {
        let present_day = Arc::new(Geometry::Polyline(vec![ll(0.0, 0.0), ll(10.0, 10.0)]));
        let rotation = Rotation::from_euler_pole(LatLonPoint::new(45.0, 45.0), 60.0);
        let deferred = DeferredGeometry::Rotated {
            present_day: present_day.clone(),
            rotation,
        };
        let bounds = deferred.bounding_small_circle();
        for p in deferred.geometry().points() {
            assert!(bounds.contains_point(p));
        }
    }
}
