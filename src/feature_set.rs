use std::fmt;

use ndarray::ArrayView2;

use crate::error::SiftError;
use crate::DESCRIPTOR_SIZE;

/// Where the up to date copy of a [`FeatureSet`] lives.
///
/// The device domain is the packed layout the data-parallel stages (detection, matching) read and
/// write. The host domain is a plain `Vec<Keypoint>` the estimation stages and callers read.
/// Moving data between the two only happens through [`FeatureSet::upload`] and
/// [`FeatureSet::download`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    Host,
    Device,
    /// Both copies are identical.
    Synced,
}

impl Location {
    fn host_valid(self) -> bool {
        matches!(self, Location::Host | Location::Synced)
    }

    fn device_valid(self) -> bool {
        matches!(self, Location::Device | Location::Synced)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Location::Host => "host",
            Location::Device => "device",
            Location::Synced => "host and device",
        })
    }
}

/// Correspondence of a keypoint in set A with its nearest neighbour in set B.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Match {
    /// Index of the nearest keypoint in B.
    pub index: usize,
    /// Position of that keypoint.
    pub x: f32,
    pub y: f32,
    /// Euclidean descriptor distance to it.
    pub error: f32,
    /// Squared distance to the nearest over squared distance to the second nearest, in `[0, 1]`.
    pub ambiguity: f32,
}

impl Match {
    /// Cosine similarity of the two unit length descriptors.
    pub fn similarity(&self) -> f32 {
        1.0 - 0.5 * self.error * self.error
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Keypoint {
    /// Position in input image pixels.
    pub x: f32,
    pub y: f32,
    /// Blur level the keypoint was detected at, in input image pixels.
    pub scale: f32,
    /// Interpolated DoG value at the extremum.
    pub sharpness: f32,
    /// `tr(H)² / det(H)` of the spatial DoG Hessian.
    pub edgeness: f32,
    /// Dominant gradient direction in radians, in `[0, 2π)`, with y pointing down.
    pub orientation: f32,
    pub score: f32,
    /// Size of one pixel of the octave the keypoint was found in, in input pixels.
    pub subsampling: f32,
    pub descriptor: [f32; DESCRIPTOR_SIZE],
    pub matched: Option<Match>,
}

impl Keypoint {
    pub fn new(x: f32, y: f32, scale: f32, descriptor: [f32; DESCRIPTOR_SIZE]) -> Self {
        Self {
            x,
            y,
            scale,
            sharpness: 0.0,
            edgeness: 0.0,
            orientation: 0.0,
            score: 0.0,
            subsampling: 1.0,
            descriptor,
            matched: None,
        }
    }

    fn record(&self) -> PointRecord {
        PointRecord {
            x: self.x,
            y: self.y,
            scale: self.scale,
            sharpness: self.sharpness,
            edgeness: self.edgeness,
            orientation: self.orientation,
            score: self.score,
            subsampling: self.subsampling,
        }
    }
}

/// Keypoint without its descriptor and match, as stored in the device domain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct PointRecord {
    pub x: f32,
    pub y: f32,
    pub scale: f32,
    pub sharpness: f32,
    pub edgeness: f32,
    pub orientation: f32,
    pub score: f32,
    pub subsampling: f32,
}

/// Structure of arrays layout read by the matcher.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct DeviceFeatures {
    pub points: Vec<PointRecord>,
    /// `points.len()` rows of `DESCRIPTOR_SIZE` floats.
    pub descriptors: Vec<f32>,
    pub matches: Vec<Option<Match>>,
}

impl DeviceFeatures {
    fn from_keypoints(keypoints: &[Keypoint]) -> Self {
        let mut descriptors = Vec::with_capacity(keypoints.len() * DESCRIPTOR_SIZE);
        keypoints
            .iter()
            .for_each(|kp| descriptors.extend_from_slice(&kp.descriptor));
        Self {
            points: keypoints.iter().map(Keypoint::record).collect(),
            descriptors,
            matches: keypoints.iter().map(|kp| kp.matched).collect(),
        }
    }

    fn to_keypoints(&self) -> Vec<Keypoint> {
        self.points
            .iter()
            .zip(self.descriptors.chunks_exact(DESCRIPTOR_SIZE))
            .zip(&self.matches)
            .map(|((p, desc), matched)| Keypoint {
                x: p.x,
                y: p.y,
                scale: p.scale,
                sharpness: p.sharpness,
                edgeness: p.edgeness,
                orientation: p.orientation,
                score: p.score,
                subsampling: p.subsampling,
                descriptor: desc.try_into().expect("chunks have descriptor length"),
                matched: *matched,
            })
            .collect()
    }
}

/// Fixed capacity collection of keypoints living in the host domain, the device domain, or both.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSet {
    capacity: usize,
    location: Location,
    host: Vec<Keypoint>,
    device: DeviceFeatures,
}

impl FeatureSet {
    /// Empty host side set.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            location: Location::Host,
            host: Vec::with_capacity(capacity),
            device: DeviceFeatures::default(),
        }
    }

    /// Set written by detection. Only the device copy exists.
    pub(crate) fn from_detection(keypoints: &[Keypoint], capacity: usize) -> Self {
        debug_assert!(keypoints.len() <= capacity);
        Self {
            capacity,
            location: Location::Device,
            host: Vec::new(),
            device: DeviceFeatures::from_keypoints(keypoints),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn location(&self) -> Location {
        self.location
    }

    pub fn len(&self) -> usize {
        if self.location.device_valid() {
            self.device.points.len()
        } else {
            self.host.len()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a keypoint to the host copy. Returns `false` and leaves the set unchanged once it is
    /// full. The device copy becomes stale.
    pub fn push(&mut self, keypoint: Keypoint) -> Result<bool, SiftError> {
        if !self.location.host_valid() {
            return Err(SiftError::NotResident(Location::Host));
        }
        if self.host.len() >= self.capacity {
            return Ok(false);
        }
        self.host.push(keypoint);
        self.location = Location::Host;
        Ok(true)
    }

    pub fn keypoints(&self) -> Result<&[Keypoint], SiftError> {
        if !self.location.host_valid() {
            return Err(SiftError::NotResident(Location::Host));
        }
        Ok(&self.host)
    }

    /// `(len, 128)` view of the device side descriptors.
    pub fn descriptors(&self) -> Result<ArrayView2<f32>, SiftError> {
        let device = self.device()?;
        Ok(
            ArrayView2::from_shape((device.points.len(), DESCRIPTOR_SIZE), &device.descriptors)
                .expect("descriptor matrix has one row per point"),
        )
    }

    /// Copy the host keypoints to the device domain.
    pub fn upload(&mut self) -> Result<(), SiftError> {
        if !self.location.host_valid() {
            return Err(SiftError::NotResident(Location::Host));
        }
        if self.location == Location::Host {
            self.device = DeviceFeatures::from_keypoints(&self.host);
            self.location = Location::Synced;
        }
        Ok(())
    }

    /// Copy the device keypoints, including match results, to the host domain.
    pub fn download(&mut self) -> Result<(), SiftError> {
        if !self.location.device_valid() {
            return Err(SiftError::NotResident(Location::Device));
        }
        if self.location == Location::Device {
            self.host = self.device.to_keypoints();
            self.location = Location::Synced;
        }
        Ok(())
    }

    pub(crate) fn device(&self) -> Result<&DeviceFeatures, SiftError> {
        if !self.location.device_valid() {
            return Err(SiftError::NotResident(Location::Device));
        }
        Ok(&self.device)
    }

    /// Write access to the device match records. The host copy becomes stale.
    pub(crate) fn device_matches_mut(&mut self) -> Result<&mut [Option<Match>], SiftError> {
        if !self.location.device_valid() {
            return Err(SiftError::NotResident(Location::Device));
        }
        self.location = Location::Device;
        Ok(&mut self.device.matches)
    }
}
