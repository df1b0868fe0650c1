//! Providers of coordinates, energies and forces.
//!
//! File-format loaders live outside this crate; they plug in by implementing
//! [`Dataset`] and [`Model`]. The engine only relies on the fingerprint to key
//! cache entries and on the accessors below to feed producers.

use std::sync::{Arc, PoisonError, RwLock};

use crate::array::Array;
use crate::core::{ArcStr, Blake3Hasher, Hash32};
use crate::error::DataError;

/// A reference dataset of molecular configurations.
pub trait Dataset: Send + Sync {
    /// Stable, content-derived identity.
    fn fingerprint(&self) -> &str;

    fn name(&self) -> &str;

    /// Number of configurations.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn n_atoms(&self) -> usize;

    /// Atomic numbers, one per atom.
    fn elements(&self) -> Vec<u32>;

    /// Coordinates shaped `[configurations, atoms, 3]`.
    fn coordinates(&self, indices: Option<&[usize]>) -> Result<Array, DataError>;

    /// Reference energies shaped `[configurations]`, if the dataset has them.
    fn energies(&self, indices: Option<&[usize]>) -> Result<Option<Array>, DataError>;

    /// Reference forces shaped `[configurations, atoms, 3]`, if present.
    fn forces(&self, indices: Option<&[usize]>) -> Result<Option<Array>, DataError>;

    /// Downcast hook for sub-datasets.
    fn as_subset(&self) -> Option<&SubDataset> {
        None
    }
}

/// Output of one model evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Prediction {
    pub energies: Option<Array>,
    pub forces: Option<Array>,
}

/// A force-field model that predicts energies and/or forces.
pub trait Model: Send + Sync {
    fn fingerprint(&self) -> &str;

    fn name(&self) -> &str;

    /// Whether one evaluation yields energies and forces together.
    fn single_predict(&self) -> bool {
        false
    }

    /// Placeholder reconstructed from cached results only.
    fn is_ghost(&self) -> bool {
        false
    }

    /// Evaluates a batch. `coordinates` is shaped `[batch, atoms, 3]`.
    fn predict(&self, coordinates: &Array, elements: &[u32]) -> anyhow::Result<Prediction>;
}

// ******************************
// *          Datasets          *
// ******************************

/// A dataset held entirely in memory.
pub struct MemoryDataset {
    fingerprint: String,
    name: String,
    elements: Vec<u32>,
    coordinates: Array,
    energies: Option<Array>,
    forces: Option<Array>,
}

impl MemoryDataset {
    pub fn new(
        name: impl Into<String>,
        elements: Vec<u32>,
        coordinates: Array,
        energies: Option<Array>,
        forces: Option<Array>,
    ) -> Result<Self, DataError> {
        let name = name.into();

        if coordinates.ndim() != 3 || coordinates.len_of(1) != elements.len() {
            return Err(DataError::Shape {
                shape: coordinates.shape().to_vec(),
                len: elements.len(),
            });
        }

        let configurations = coordinates.len_of(0);
        if let Some(energies) = &energies
            && energies.shape() != [configurations]
        {
            return Err(DataError::Shape {
                shape: energies.shape().to_vec(),
                len: configurations,
            });
        }
        if let Some(forces) = &forces
            && forces.shape() != coordinates.shape()
        {
            return Err(DataError::Concat(
                coordinates.shape().to_vec(),
                forces.shape().to_vec(),
            ));
        }

        let mut hasher = Blake3Hasher::default();
        hasher.update_str(&name);
        hasher.update_usizes(&elements.iter().map(|&e| e as usize).collect::<Vec<_>>());
        hasher.update_usizes(coordinates.shape());
        hasher.update_f64s(&coordinates.to_vec());
        for array in [&energies, &forces] {
            match array {
                Some(array) => hasher.update_f64s(&array.to_vec()),
                None => hasher.update_str("none"),
            };
        }

        Ok(Self {
            fingerprint: Hash32::from(hasher).to_short_hex(),
            name,
            elements,
            coordinates,
            energies,
            forces,
        })
    }
}

fn pick(array: &Array, indices: Option<&[usize]>) -> Result<Array, DataError> {
    match indices {
        Some(indices) => array.select(0, indices),
        None => Ok(array.clone()),
    }
}

impl Dataset for MemoryDataset {
    fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> usize {
        self.coordinates.len_of(0)
    }

    fn n_atoms(&self) -> usize {
        self.elements.len()
    }

    fn elements(&self) -> Vec<u32> {
        self.elements.clone()
    }

    fn coordinates(&self, indices: Option<&[usize]>) -> Result<Array, DataError> {
        pick(&self.coordinates, indices)
    }

    fn energies(&self, indices: Option<&[usize]>) -> Result<Option<Array>, DataError> {
        self.energies
            .as_ref()
            .map(|array| pick(array, indices))
            .transpose()
    }

    fn forces(&self, indices: Option<&[usize]>) -> Result<Option<Array>, DataError> {
        self.forces
            .as_ref()
            .map(|array| pick(array, indices))
            .transpose()
    }
}

/// A selection over a parent dataset.
///
/// Index sub-datasets pick configurations, atom-filtered ones pick atoms.
/// The fingerprint depends only on `(parent, model, sub_name)`, so updating
/// the selection in place keeps every cache entry keyed to it.
pub struct SubDataset {
    fingerprint: String,
    name: String,
    parent: Arc<dyn Dataset>,
    model: Option<ArcStr>,
    sub_name: String,
    atom_filtered: bool,
    indices: RwLock<Arc<[usize]>>,
}

impl SubDataset {
    pub fn new(
        parent: Arc<dyn Dataset>,
        model: Option<ArcStr>,
        sub_name: impl Into<String>,
        indices: Vec<usize>,
        atom_filtered: bool,
    ) -> Self {
        let sub_name = sub_name.into();
        let fingerprint = Self::fingerprint_for(parent.fingerprint(), model.as_deref(), &sub_name);
        let name = format!("{} ({})", parent.name(), sub_name);

        Self {
            fingerprint,
            name,
            parent,
            model,
            sub_name,
            atom_filtered,
            indices: RwLock::new(indices.into()),
        }
    }

    /// Fingerprint a sub-dataset with this identity has, whether or not it exists.
    pub fn fingerprint_for(parent: &str, model: Option<&str>, sub_name: &str) -> String {
        let mut hasher = Blake3Hasher::default();
        hasher
            .update_str("subset")
            .update_str(parent)
            .update_str(model.unwrap_or("nil"))
            .update_str(sub_name);
        Hash32::from(hasher).to_short_hex()
    }

    pub fn parent(&self) -> &Arc<dyn Dataset> {
        &self.parent
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn sub_name(&self) -> &str {
        &self.sub_name
    }

    pub fn is_atom_filtered(&self) -> bool {
        self.atom_filtered
    }

    pub fn indices(&self) -> Arc<[usize]> {
        self.indices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replaces the selection, returning whether it changed.
    pub(crate) fn set_indices(&self, indices: Vec<usize>) -> bool {
        let mut current = self.indices.write().unwrap_or_else(PoisonError::into_inner);
        if current[..] == indices[..] {
            return false;
        }
        *current = indices.into();
        true
    }

    /// Maps configuration indices of this subset onto the parent.
    fn parent_indices(&self, indices: Option<&[usize]>) -> Result<Vec<usize>, DataError> {
        let own = self.indices();
        match indices {
            None => Ok(own.to_vec()),
            Some(indices) => indices
                .iter()
                .map(|&i| {
                    own.get(i).copied().ok_or(DataError::IndexOutOfBounds {
                        axis: 0,
                        index: i,
                        len: own.len(),
                    })
                })
                .collect(),
        }
    }

    fn fetch<F>(&self, indices: Option<&[usize]>, get: F) -> Result<Option<Array>, DataError>
    where
        F: Fn(&dyn Dataset, Option<&[usize]>) -> Result<Option<Array>, DataError>,
    {
        if self.atom_filtered {
            get(self.parent.as_ref(), indices)?
                .map(|array| array.select(1, &self.indices()))
                .transpose()
        } else {
            let mapped = self.parent_indices(indices)?;
            get(self.parent.as_ref(), Some(&mapped))
        }
    }
}

impl Dataset for SubDataset {
    fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> usize {
        if self.atom_filtered {
            self.parent.len()
        } else {
            self.indices().len()
        }
    }

    fn n_atoms(&self) -> usize {
        if self.atom_filtered {
            self.indices().len()
        } else {
            self.parent.n_atoms()
        }
    }

    fn elements(&self) -> Vec<u32> {
        let elements = self.parent.elements();
        if self.atom_filtered {
            self.indices()
                .iter()
                .filter_map(|&i| elements.get(i).copied())
                .collect()
        } else {
            elements
        }
    }

    fn coordinates(&self, indices: Option<&[usize]>) -> Result<Array, DataError> {
        self.fetch(indices, |parent, indices| parent.coordinates(indices).map(Some))?
            .ok_or_else(|| DataError::MissingField("coordinates".into()))
    }

    fn energies(&self, indices: Option<&[usize]>) -> Result<Option<Array>, DataError> {
        if self.atom_filtered {
            // energies have no atom axis
            return self.parent.energies(indices);
        }
        self.fetch(indices, |parent, indices| parent.energies(indices))
    }

    fn forces(&self, indices: Option<&[usize]>) -> Result<Option<Array>, DataError> {
        self.fetch(indices, |parent, indices| parent.forces(indices))
    }

    fn as_subset(&self) -> Option<&SubDataset> {
        Some(self)
    }
}

// ******************************
// *           Models           *
// ******************************

type PredictFn = Box<dyn Fn(&Array, &[u32]) -> anyhow::Result<Prediction> + Send + Sync>;

/// A model backed by a closure, for loaders that wrap an external predictor.
pub struct FnModel {
    fingerprint: String,
    name: String,
    single_predict: bool,
    predict: PredictFn,
}

impl FnModel {
    pub fn new<F>(name: impl Into<String>, fingerprint: impl Into<String>, predict: F) -> Self
    where
        F: Fn(&Array, &[u32]) -> anyhow::Result<Prediction> + Send + Sync + 'static,
    {
        Self {
            fingerprint: fingerprint.into(),
            name: name.into(),
            single_predict: false,
            predict: Box::new(predict),
        }
    }

    /// Marks the model as computing energies and forces in one pass.
    pub fn single_predict(mut self) -> Self {
        self.single_predict = true;
        self
    }
}

impl Model for FnModel {
    fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn single_predict(&self) -> bool {
        self.single_predict
    }

    fn predict(&self, coordinates: &Array, elements: &[u32]) -> anyhow::Result<Prediction> {
        (self.predict)(coordinates, elements)
    }
}

/// Stand-in for a model whose artifact is unavailable, rebuilt from the
/// fingerprint (and name, if archived) of cached results.
#[derive(Debug, Clone)]
pub struct GhostModel {
    fingerprint: String,
    name: String,
}

impl GhostModel {
    pub fn new(fingerprint: impl Into<String>, name: Option<String>) -> Self {
        let fingerprint = fingerprint.into();
        let name = name.unwrap_or_else(|| format!("ghost {fingerprint}"));
        Self { fingerprint, name }
    }
}

impl Model for GhostModel {
    fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_ghost(&self) -> bool {
        true
    }

    fn predict(&self, _: &Array, _: &[u32]) -> anyhow::Result<Prediction> {
        anyhow::bail!("model '{}' is a placeholder and can't predict", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset() -> Arc<dyn Dataset> {
        // 4 configurations, 2 atoms
        let coordinates = Array::new(vec![4, 2, 3], (0..24).map(f64::from).collect()).unwrap();
        let energies = Array::from_vec(vec![10.0, 11.0, 12.0, 13.0]);
        let forces = Array::new(vec![4, 2, 3], (0..24).map(|x| -f64::from(x)).collect()).unwrap();
        Arc::new(
            MemoryDataset::new("water", vec![8, 1], coordinates, Some(energies), Some(forces))
                .unwrap(),
        )
    }

    #[test]
    fn test_fingerprint_is_content_derived() {
        let a = dataset();
        let b = dataset();
        assert_eq!(a.fingerprint(), b.fingerprint());

        let other = MemoryDataset::new(
            "water",
            vec![8, 1],
            Array::zeros(vec![1, 2, 3]),
            None,
            None,
        )
        .unwrap();
        assert_ne!(a.fingerprint(), other.fingerprint());
    }

    #[test]
    fn test_rejects_mismatched_energies() {
        let result = MemoryDataset::new(
            "bad",
            vec![1],
            Array::zeros(vec![2, 1, 3]),
            Some(Array::from_vec(vec![1.0])),
            None,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_index_subset_delegates() {
        let parent = dataset();
        let subset = SubDataset::new(parent, None, "selection", vec![3, 1], false);

        assert_eq!(subset.len(), 2);
        assert_eq!(subset.n_atoms(), 2);
        assert_eq!(
            subset.energies(None).unwrap().unwrap().to_vec(),
            &[13.0, 11.0]
        );
        assert_eq!(
            subset.energies(Some(&[1])).unwrap().unwrap().to_vec(),
            &[11.0]
        );
        assert!(subset.energies(Some(&[2])).is_err());
    }

    #[test]
    fn test_atom_subset_delegates() {
        let parent = dataset();
        let subset = SubDataset::new(parent, None, "hydrogen", vec![1], true);

        assert_eq!(subset.len(), 4);
        assert_eq!(subset.n_atoms(), 1);
        assert_eq!(subset.elements(), vec![1]);

        let coordinates = subset.coordinates(Some(&[0])).unwrap();
        assert_eq!(coordinates.shape(), &[1, 1, 3]);
        assert_eq!(coordinates.to_vec(), &[3.0, 4.0, 5.0]);

        // energies are per configuration and pass through
        assert_eq!(subset.energies(None).unwrap().unwrap().len_of(0), 4);
    }

    #[test]
    fn test_subset_fingerprint_ignores_indices() {
        let parent = dataset();
        let a = SubDataset::new(parent.clone(), None, "sel", vec![0], false);
        let b = SubDataset::new(parent.clone(), None, "sel", vec![1, 2], false);
        let c = SubDataset::new(parent, Some("m1".into()), "sel", vec![0], false);

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_set_indices_reports_change() {
        let subset = SubDataset::new(dataset(), None, "sel", vec![0], false);
        assert!(!subset.set_indices(vec![0]));
        assert!(subset.set_indices(vec![1, 2]));
        assert_eq!(&subset.indices()[..], &[1, 2]);
    }

    #[test]
    fn test_ghost_cannot_predict() {
        let ghost = GhostModel::new("abc", None);
        assert!(ghost.is_ghost());
        assert_eq!(ghost.name(), "ghost abc");
        assert!(ghost.predict(&Array::zeros(vec![1, 1, 3]), &[1]).is_err());
    }
}
