//! Dataset and model anchors.
//!
//! An anchor binds the defining attributes of a dataset split or a trained
//! model version to a single digest. Descriptors are closed structs rather
//! than free-form maps so that every digest is computed over a canonical,
//! exhaustively-defined byte layout (see [`super::canonical_bytes`]).
//!
//! Anchors are created once and never mutated. Their digests are pure
//! functions of the stored fields; [`DatasetAnchor::check`] and
//! [`ModelAnchor::check`] recompute them and report the first discrepancy.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{
    Commitment, DatasetAnchorId, Discrepancy, Hash256, ModelAnchorId, canonical_bytes,
};
use crate::error::EvidenceError;
use crate::merkle::MerkleTree;

const DATASET_METADATA_TAG: &str = "anchor/dataset-metadata/v1";
const DATASET_ANCHOR_TAG: &str = "anchor/dataset-anchor/v1";
const ARCHITECTURE_TAG: &str = "anchor/model-architecture/v1";
const HYPERPARAMETER_TAG: &str = "anchor/model-hyperparameters/v1";
const ENVIRONMENT_TAG: &str = "anchor/model-environment/v1";
const MODEL_ANCHOR_TAG: &str = "anchor/model-anchor/v1";

/// Designation of a dataset split.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetSplit {
    Train,
    Validation,
    Test,
    Holdout,
    /// Any other split name; must be a valid identifier component.
    Custom(String),
}

impl DatasetSplit {
    pub fn as_str(&self) -> &str {
        match self {
            DatasetSplit::Train => "train",
            DatasetSplit::Validation => "validation",
            DatasetSplit::Test => "test",
            DatasetSplit::Holdout => "holdout",
            DatasetSplit::Custom(name) => name,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "train" => DatasetSplit::Train,
            "validation" => DatasetSplit::Validation,
            "test" => DatasetSplit::Test,
            "holdout" => DatasetSplit::Holdout,
            other => DatasetSplit::Custom(other.to_string()),
        }
    }
}

/// One column of a dataset schema.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureField {
    pub name: String,
    /// Logical data type, e.g. `"float32"` or `"category"`.
    pub dtype: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetSchema {
    /// Feature columns in their canonical order.
    pub features: Vec<FeatureField>,
    /// Name of the label column, if the split is labelled.
    pub label: Option<String>,
}

/// Data-quality descriptors captured at freeze time.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityDescriptor {
    /// Fraction of missing cells, in `[0, 1]`.
    pub missing_ratio: f64,
    /// Fraction of duplicated samples, in `[0, 1]`.
    pub duplicate_ratio: f64,
    /// Estimated fraction of mislabelled samples, if measured.
    pub label_noise_estimate: Option<f64>,
}

/// Fairness-relevant descriptors captured at freeze time.
///
/// This only records what was declared; no statistical analysis is done here.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FairnessDescriptor {
    pub protected_attributes: Vec<String>,
    pub notes: Option<String>,
}

/// Descriptive metadata of a dataset split.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetMetadata {
    pub schema: DatasetSchema,
    pub sample_count: u64,
    pub size_bytes: u64,
    /// Where the data was frozen from (URI, bucket path, ...).
    pub source: Option<String>,
    pub quality: Option<QualityDescriptor>,
    pub fairness: Option<FairnessDescriptor>,
}

impl DatasetMetadata {
    /// Digest over the canonical encoding of the metadata.
    pub fn digest(&self) -> Hash256 {
        Hash256::tagged(DATASET_METADATA_TAG, &[&canonical_bytes(self)])
    }
}

/// Commitment to one frozen dataset split.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DatasetAnchor {
    pub id: DatasetAnchorId,
    pub dataset_id: String,
    pub split: DatasetSplit,
    pub metadata: DatasetMetadata,
    pub metadata_digest: Hash256,
    /// Per-sample commitments in their original order.
    pub sample_commitments: Vec<Commitment>,
    /// Merkle root over `sample_commitments`.
    pub merkle_root: Hash256,
    /// Combined digest of metadata digest and Merkle root.
    pub anchor_digest: Hash256,
    /// Freeze time in ms since the Unix epoch. Not covered by the digest.
    pub created_at_ms: u64,
}

impl DatasetAnchor {
    /// Builds an anchor, computing the Merkle tree and all digests.
    ///
    /// Fails with [`crate::merkle::MerkleError::EmptyLeafSet`] when no sample
    /// commitments are given.
    pub fn build(
        dataset_id: &str,
        split: DatasetSplit,
        metadata: DatasetMetadata,
        sample_commitments: Vec<Commitment>,
        created_at_ms: u64,
    ) -> Result<Self, EvidenceError> {
        let id = DatasetAnchorId::new(dataset_id, &split)?;
        let merkle_root = Self::sample_root(&sample_commitments)?;
        let metadata_digest = metadata.digest();
        let anchor_digest = Self::compute_digest(&id, &metadata_digest, &merkle_root);

        Ok(Self {
            id,
            dataset_id: dataset_id.to_string(),
            split,
            metadata,
            metadata_digest,
            sample_commitments,
            merkle_root,
            anchor_digest,
            created_at_ms,
        })
    }

    /// Merkle root over a list of sample commitments.
    pub fn sample_root(samples: &[Commitment]) -> Result<Hash256, EvidenceError> {
        let leaves: Vec<Hash256> = samples.iter().map(|c| c.0).collect();
        Ok(MerkleTree::build(&leaves)?.root())
    }

    pub fn compute_digest(
        id: &DatasetAnchorId,
        metadata_digest: &Hash256,
        merkle_root: &Hash256,
    ) -> Hash256 {
        Hash256::tagged(
            DATASET_ANCHOR_TAG,
            &[
                id.as_str().as_bytes(),
                metadata_digest.as_bytes(),
                merkle_root.as_bytes(),
            ],
        )
    }

    /// Recomputes every digest from the stored components.
    pub fn check(&self) -> Result<(), Discrepancy> {
        let expected_id = DatasetAnchorId::new(&self.dataset_id, &self.split)
            .map_err(|e| Discrepancy::Undecodable(e.to_string()))?;
        if expected_id != self.id {
            return Err(Discrepancy::KeyMismatch {
                expected: expected_id.to_string(),
                actual: self.id.to_string(),
            });
        }
        if self.metadata.digest() != self.metadata_digest {
            return Err(Discrepancy::MetadataDigest);
        }
        let root = Self::sample_root(&self.sample_commitments)
            .map_err(|_| Discrepancy::MerkleRoot)?;
        if root != self.merkle_root {
            return Err(Discrepancy::MerkleRoot);
        }
        if Self::compute_digest(&self.id, &self.metadata_digest, &self.merkle_root)
            != self.anchor_digest
        {
            return Err(Discrepancy::AnchorDigest);
        }
        Ok(())
    }
}

/// Architecture of a trained model.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureDescriptor {
    /// Model family, e.g. `"resnet"` or `"gradient-boosted-trees"`.
    pub family: String,
    /// Training framework, e.g. `"pytorch"`.
    pub framework: String,
    pub parameter_count: u64,
    /// Ordered, human-readable layer summary.
    pub layers: Vec<String>,
}

impl ArchitectureDescriptor {
    pub fn digest(&self) -> Hash256 {
        Hash256::tagged(ARCHITECTURE_TAG, &[&canonical_bytes(self)])
    }
}

/// A single hyperparameter value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HyperValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

/// Hyperparameters keyed by name. `BTreeMap` keeps the encoding canonical.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HyperparameterSet(pub BTreeMap<String, HyperValue>);

impl HyperparameterSet {
    pub fn with(mut self, name: &str, value: HyperValue) -> Self {
        self.0.insert(name.to_string(), value);
        self
    }

    pub fn digest(&self) -> Hash256 {
        Hash256::tagged(HYPERPARAMETER_TAG, &[&canonical_bytes(self)])
    }
}

/// Training/serving environment of a model.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentDescriptor {
    /// Runtime, e.g. `"python-3.11"`.
    pub runtime: String,
    pub framework_version: String,
    pub hardware: Option<String>,
    /// Dependency pins, package name to version.
    pub dependencies: BTreeMap<String, String>,
    pub random_seed: Option<u64>,
}

impl EnvironmentDescriptor {
    pub fn digest(&self) -> Hash256 {
        Hash256::tagged(ENVIRONMENT_TAG, &[&canonical_bytes(self)])
    }
}

/// Dataset anchor authorized for a model, pinned to its digest at creation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuthorizedDataset {
    pub id: DatasetAnchorId,
    pub anchor_digest: Hash256,
}

/// Everything needed to register a model version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelAnchorSpec {
    pub name: String,
    pub version: String,
    pub architecture: ArchitectureDescriptor,
    /// Commitment to the trained parameters (weights file, checkpoint).
    pub parameters: Commitment,
    pub hyperparameters: HyperparameterSet,
    pub environment: EnvironmentDescriptor,
    pub authorized_datasets: Vec<DatasetAnchorId>,
}

/// Commitment to one trained model version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelAnchor {
    pub id: ModelAnchorId,
    pub name: String,
    pub version: String,
    pub architecture: ArchitectureDescriptor,
    pub hyperparameters: HyperparameterSet,
    pub environment: EnvironmentDescriptor,
    pub architecture_digest: Hash256,
    pub parameters_digest: Hash256,
    pub hyperparameter_digest: Hash256,
    pub environment_digest: Hash256,
    pub authorized_datasets: Vec<AuthorizedDataset>,
    pub model_digest: Hash256,
    pub created_at_ms: u64,
}

impl ModelAnchor {
    /// Builds a model anchor from a spec whose datasets have been resolved.
    ///
    /// Resolution (existence and validity of each dataset anchor) is the
    /// registry's job; this only computes digests.
    pub fn build(
        spec: ModelAnchorSpec,
        authorized_datasets: Vec<AuthorizedDataset>,
        created_at_ms: u64,
    ) -> Result<Self, EvidenceError> {
        let id = ModelAnchorId::new(&spec.name, &spec.version)?;
        let architecture_digest = spec.architecture.digest();
        let parameters_digest = spec.parameters.0;
        let hyperparameter_digest = spec.hyperparameters.digest();
        let environment_digest = spec.environment.digest();

        let mut anchor = Self {
            id,
            name: spec.name,
            version: spec.version,
            architecture: spec.architecture,
            hyperparameters: spec.hyperparameters,
            environment: spec.environment,
            architecture_digest,
            parameters_digest,
            hyperparameter_digest,
            environment_digest,
            authorized_datasets,
            model_digest: Hash256::ZERO,
            created_at_ms,
        };
        anchor.model_digest = anchor.compute_digest();
        Ok(anchor)
    }

    /// Combined digest over the four component digests and the dataset list.
    pub fn compute_digest(&self) -> Hash256 {
        let datasets = canonical_bytes(&self.authorized_datasets);
        Hash256::tagged(
            MODEL_ANCHOR_TAG,
            &[
                self.id.as_str().as_bytes(),
                self.architecture_digest.as_bytes(),
                self.parameters_digest.as_bytes(),
                self.hyperparameter_digest.as_bytes(),
                self.environment_digest.as_bytes(),
                &datasets,
            ],
        )
    }

    pub fn check(&self) -> Result<(), Discrepancy> {
        let expected_id = ModelAnchorId::new(&self.name, &self.version)
            .map_err(|e| Discrepancy::Undecodable(e.to_string()))?;
        if expected_id != self.id {
            return Err(Discrepancy::KeyMismatch {
                expected: expected_id.to_string(),
                actual: self.id.to_string(),
            });
        }
        if self.architecture.digest() != self.architecture_digest
            || self.hyperparameters.digest() != self.hyperparameter_digest
            || self.environment.digest() != self.environment_digest
            || self.compute_digest() != self.model_digest
        {
            return Err(Discrepancy::ModelDigest);
        }
        Ok(())
    }
}

/// Either kind of anchor, as returned by registry lookups.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Anchor {
    Dataset(DatasetAnchor),
    Model(ModelAnchor),
}

impl Anchor {
    pub fn digest(&self) -> Hash256 {
        match self {
            Anchor::Dataset(a) => a.anchor_digest,
            Anchor::Model(m) => m.model_digest,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::commitment::commit;

    pub(crate) fn sample_metadata() -> DatasetMetadata {
        DatasetMetadata {
            schema: DatasetSchema {
                features: vec![
                    FeatureField {
                        name: "age".to_string(),
                        dtype: "int32".to_string(),
                    },
                    FeatureField {
                        name: "income".to_string(),
                        dtype: "float32".to_string(),
                    },
                ],
                label: Some("approved".to_string()),
            },
            sample_count: 4,
            size_bytes: 2048,
            source: Some("s3://datasets/credit/2024-06".to_string()),
            quality: Some(QualityDescriptor {
                missing_ratio: 0.01,
                duplicate_ratio: 0.0,
                label_noise_estimate: None,
            }),
            fairness: Some(FairnessDescriptor {
                protected_attributes: vec!["age".to_string()],
                notes: None,
            }),
        }
    }

    pub(crate) fn samples(n: usize) -> Vec<Commitment> {
        (0..n)
            .map(|i| commit(format!("sample-{i}").as_bytes(), None))
            .collect()
    }

    pub(crate) fn model_spec(datasets: Vec<DatasetAnchorId>) -> ModelAnchorSpec {
        ModelAnchorSpec {
            name: "m".to_string(),
            version: "v1".to_string(),
            architecture: ArchitectureDescriptor {
                family: "mlp".to_string(),
                framework: "pytorch".to_string(),
                parameter_count: 1_024,
                layers: vec!["linear(2,32)".to_string(), "linear(32,1)".to_string()],
            },
            parameters: commit(b"weights-v1", None),
            hyperparameters: HyperparameterSet::default()
                .with("lr", HyperValue::Float(0.001))
                .with("epochs", HyperValue::Int(10)),
            environment: EnvironmentDescriptor {
                runtime: "python-3.11".to_string(),
                framework_version: "2.3.0".to_string(),
                hardware: None,
                dependencies: BTreeMap::from([("numpy".to_string(), "1.26".to_string())]),
                random_seed: Some(7),
            },
            authorized_datasets: datasets,
        }
    }

    #[test]
    fn dataset_anchor_digest_is_pure_function_of_inputs() {
        let a = DatasetAnchor::build("ds-A", DatasetSplit::Train, sample_metadata(), samples(4), 1)
            .unwrap();
        let b = DatasetAnchor::build("ds-A", DatasetSplit::Train, sample_metadata(), samples(4), 99)
            .unwrap();
        assert_eq!(a.anchor_digest, b.anchor_digest);
        assert!(a.check().is_ok());
    }

    #[test]
    fn dataset_anchor_check_detects_changed_sample() {
        let mut a =
            DatasetAnchor::build("ds-A", DatasetSplit::Train, sample_metadata(), samples(4), 1)
                .unwrap();
        a.sample_commitments[2] = commit(b"forged", None);
        assert_eq!(a.check(), Err(Discrepancy::MerkleRoot));
    }

    #[test]
    fn dataset_anchor_check_detects_changed_metadata() {
        let mut a =
            DatasetAnchor::build("ds-A", DatasetSplit::Test, sample_metadata(), samples(3), 1)
                .unwrap();
        a.metadata.sample_count = 3_000;
        assert_eq!(a.check(), Err(Discrepancy::MetadataDigest));
    }

    #[test]
    fn empty_dataset_is_rejected() {
        let err =
            DatasetAnchor::build("ds-A", DatasetSplit::Train, sample_metadata(), vec![], 1)
                .unwrap_err();
        assert!(matches!(err, EvidenceError::Merkle(_)));
    }

    #[test]
    fn model_digest_covers_authorized_datasets() {
        let pinned = AuthorizedDataset {
            id: DatasetAnchorId::parse("ds-A:train").unwrap(),
            anchor_digest: Hash256([1u8; 32]),
        };
        let a = ModelAnchor::build(model_spec(vec![]), vec![pinned.clone()], 1).unwrap();
        let mut b = a.clone();
        b.authorized_datasets[0].anchor_digest = Hash256([2u8; 32]);
        assert!(a.check().is_ok());
        assert_eq!(b.check(), Err(Discrepancy::ModelDigest));
    }

    #[test]
    fn hyperparameter_order_does_not_matter() {
        let a = HyperparameterSet::default()
            .with("a", HyperValue::Int(1))
            .with("b", HyperValue::Bool(true));
        let b = HyperparameterSet::default()
            .with("b", HyperValue::Bool(true))
            .with("a", HyperValue::Int(1));
        assert_eq!(a.digest(), b.digest());
    }
}
