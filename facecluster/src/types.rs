use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FaceClusterError;

/// Identifies a detected face. Ids grow in detection order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FaceId(pub u64);

impl fmt::Display for FaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "face:{:06}", self.0)
    }
}

/// Identifies a cluster. Ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(pub u64);

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cluster:{:06}", self.0)
    }
}

impl FromStr for ClusterId {
    type Err = std::num::ParseIntError;

    /// Accepts both `"12"` and `"cluster:000012"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("cluster:").unwrap_or(s);
        digits.parse().map(ClusterId)
    }
}

/// What a cluster depicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterKind {
    #[default]
    Person,
    Pet,
    Unknown,
}

impl ClusterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterKind::Person => "person",
            ClusterKind::Pet => "pet",
            ClusterKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ClusterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClusterKind {
    type Err = FaceClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "person" => Ok(ClusterKind::Person),
            "pet" => Ok(ClusterKind::Pet),
            "unknown" => Ok(ClusterKind::Unknown),
            _ => Err(FaceClusterError::InvalidKind(s.to_string())),
        }
    }
}

/// One face detected by the analysis service, as handed to
/// [`Manager::process_faces`](crate::Manager::process_faces).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceInput {
    pub encoding: Vec<f32>,

    /// Bounding box, passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Value>,

    #[serde(default)]
    pub confidence: f32,
}

/// A detected face and its current cluster assignment.
#[derive(Clone, Serialize, Deserialize)]
pub struct Face {
    pub id: FaceId,

    /// Owning image reference.
    pub image_id: String,

    /// Position of the face in the detector output for its image.
    pub index: u32,

    pub encoding: Vec<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Value>,

    pub confidence: f32,

    /// `None` while the face is unassigned.
    #[serde(default)]
    pub cluster_id: Option<ClusterId>,
}

impl fmt::Debug for Face {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Face")
            .field("id", &self.id)
            .field("image_id", &self.image_id)
            .field("index", &self.index)
            .field("encoding_len", &self.encoding.len())
            .field("confidence", &self.confidence)
            .field("cluster_id", &self.cluster_id)
            .finish()
    }
}

/// One identity and its statistics.
#[derive(Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: ClusterId,

    /// User-assigned display name.
    #[serde(default)]
    pub name: Option<String>,

    #[serde(rename = "type", default)]
    pub kind: ClusterKind,

    /// Component-wise mean of the member encodings.
    pub representative_encoding: Vec<f32>,

    /// Image shown for this cluster.
    #[serde(default)]
    pub thumbnail: Option<String>,

    /// Number of distinct images contributing a member face.
    pub photo_count: usize,
}

impl Cluster {
    pub fn summary(&self) -> ClusterSummary {
        ClusterSummary {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind,
            photo_count: self.photo_count,
            thumbnail: self.thumbnail.clone(),
        }
    }
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("photo_count", &self.photo_count)
            .field("thumbnail", &self.thumbnail)
            .field("centroid_len", &self.representative_encoding.len())
            .finish()
    }
}

/// Display-facing view of a cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub id: ClusterId,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: ClusterKind,
    pub photo_count: usize,
    pub thumbnail: Option<String>,
}

/// Result of assigning one face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceAssignment {
    pub face_id: FaceId,
    pub cluster_id: ClusterId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_kind_round_trips_through_str() {
        for kind in [ClusterKind::Person, ClusterKind::Pet, ClusterKind::Unknown] {
            assert_eq!(kind.as_str().parse::<ClusterKind>().unwrap(), kind);
        }
        assert_eq!(" Pet ".parse::<ClusterKind>().unwrap(), ClusterKind::Pet);
        assert!(matches!(
            "robot".parse::<ClusterKind>(),
            Err(FaceClusterError::InvalidKind(_))
        ));
    }

    #[test]
    fn cluster_id_parses_with_or_without_prefix() {
        assert_eq!("12".parse::<ClusterId>().unwrap(), ClusterId(12));
        assert_eq!("cluster:000012".parse::<ClusterId>().unwrap(), ClusterId(12));
        assert!("abc".parse::<ClusterId>().is_err());
        assert_eq!(ClusterId(12).to_string(), "cluster:000012");
    }

    #[test]
    fn cluster_serializes_kind_as_type() {
        let c = Cluster {
            id: ClusterId(1),
            name: None,
            kind: ClusterKind::Pet,
            representative_encoding: vec![1.0],
            thumbnail: None,
            photo_count: 1,
        };
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["type"], "pet");
        assert_eq!(json["id"], 1);
    }

    #[test]
    fn face_input_defaults() {
        let input: FaceInput = serde_json::from_str(r#"{"encoding": [0.5, 0.5]}"#).unwrap();
        assert_eq!(input.encoding, vec![0.5, 0.5]);
        assert!(input.location.is_none());
        assert_eq!(input.confidence, 0.0);
    }
}
