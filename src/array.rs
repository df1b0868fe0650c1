//! Dense numeric storage for per-configuration and per-atom quantities.
//!
//! An array keeps its logical shape next to a [`DMatrix`] holding one row per
//! configuration, with the trailing axes flattened row-major into columns.
//! Axis 0 is the configuration axis, axis 1 the atom axis, which is all the
//! slicing the cache needs.

use nalgebra::{DMatrix, Point3};
use serde::{Deserialize, Serialize};

use crate::error::DataError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Array {
    shape: Vec<usize>,
    rows: DMatrix<f64>,
}

/// Rows and columns of the backing matrix for a logical shape.
fn matrix_dims(shape: &[usize]) -> (usize, usize) {
    match shape.split_first() {
        Some((&rows, trailing)) => (rows, trailing.iter().product()),
        None => (1, 1),
    }
}

impl Array {
    /// Array of `shape` from row-major `data`.
    pub fn new(shape: Vec<usize>, data: Vec<f64>) -> Result<Self, DataError> {
        let len = shape.iter().product::<usize>();
        if len != data.len() {
            return Err(DataError::Shape {
                shape,
                len: data.len(),
            });
        }

        let (nrows, ncols) = matrix_dims(&shape);
        let rows = DMatrix::from_row_slice(nrows, ncols, &data);
        Ok(Self { shape, rows })
    }

    /// One-dimensional array, e.g. one energy per configuration.
    pub fn from_vec(data: Vec<f64>) -> Self {
        Self {
            shape: vec![data.len()],
            rows: DMatrix::from_vec(data.len(), 1, data),
        }
    }

    /// Per-atom positions or vectors, one inner `Vec` per configuration. All
    /// configurations must have the same number of atoms.
    pub fn from_points(configurations: &[Vec<Point3<f64>>]) -> Result<Self, DataError> {
        let atoms = configurations.first().map_or(0, Vec::len);
        let data = configurations
            .iter()
            .flat_map(|points| points.iter().flat_map(|p| p.coords.iter().copied()))
            .collect();
        Self::new(vec![configurations.len(), atoms, 3], data)
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let (nrows, ncols) = matrix_dims(&shape);
        Self {
            shape,
            rows: DMatrix::zeros(nrows, ncols),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn len_of(&self, axis: usize) -> usize {
        self.shape.get(axis).copied().unwrap_or(0)
    }

    /// One row per configuration.
    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.rows
    }

    /// Values in row-major order.
    pub fn to_vec(&self) -> Vec<f64> {
        self.rows.transpose().as_slice().to_vec()
    }

    pub fn get(&self, index: &[usize]) -> Option<f64> {
        if index.len() != self.shape.len() {
            return None;
        }
        let Some((&row, trailing)) = index.split_first() else {
            return self.rows.get((0, 0)).copied();
        };

        let mut column = 0;
        for (&i, &n) in trailing.iter().zip(&self.shape[1..]) {
            if i >= n {
                return None;
            }
            column = column * n + i;
        }

        self.rows.get((row, column)).copied()
    }

    /// Atoms of one configuration as points, for arrays shaped
    /// `[configurations, atoms, 3]`.
    pub fn points(&self, configuration: usize) -> Option<Vec<Point3<f64>>> {
        if self.ndim() != 3 || self.shape[2] != 3 || configuration >= self.shape[0] {
            return None;
        }

        let row = self.rows.row(configuration);
        let points = (0..self.shape[1])
            .map(|atom| Point3::new(row[atom * 3], row[atom * 3 + 1], row[atom * 3 + 2]))
            .collect();
        Some(points)
    }

    /// Applies `f` to every value.
    pub fn map(&self, f: impl FnMut(f64) -> f64) -> Array {
        Array {
            shape: self.shape.clone(),
            rows: self.rows.map(f),
        }
    }

    /// Picks `indices` along `axis`, in the given order.
    pub fn select(&self, axis: usize, indices: &[usize]) -> Result<Array, DataError> {
        if axis >= self.ndim() {
            return Err(DataError::Axis {
                axis,
                ndim: self.ndim(),
            });
        }

        let dim = self.shape[axis];
        if let Some(&index) = indices.iter().find(|&&i| i >= dim) {
            return Err(DataError::IndexOutOfBounds {
                axis,
                index,
                len: dim,
            });
        }

        let mut shape = self.shape.clone();
        shape[axis] = indices.len();

        if axis == 0 {
            let rows = self.rows.select_rows(indices.iter());
            return Ok(Array { shape, rows });
        }

        // axis >= 1 lives in the flattened columns
        let outer: usize = self.shape[1..axis].iter().product();
        let inner: usize = self.shape[axis + 1..].iter().product();

        let mut columns = Vec::with_capacity(outer * indices.len() * inner);
        for o in 0..outer {
            for &i in indices {
                let start = (o * dim + i) * inner;
                columns.extend(start..start + inner);
            }
        }

        let rows = self.rows.select_columns(columns.iter());
        Ok(Array { shape, rows })
    }

    /// Joins arrays along axis 0. All trailing dimensions must agree.
    pub fn concat(parts: &[Array]) -> Result<Array, DataError> {
        let Some(first) = parts.first() else {
            return Ok(Array::from_vec(vec![]));
        };

        let mut shape = first.shape.clone();
        for (i, part) in parts.iter().enumerate() {
            if part.ndim() == 0 || part.shape[1..] != first.shape[1..] {
                return Err(DataError::Concat(first.shape.clone(), part.shape.clone()));
            }
            if i > 0 {
                shape[0] += part.shape[0];
            }
        }

        let mut rows = DMatrix::zeros(shape[0], first.rows.ncols());
        let mut offset = 0;
        for part in parts {
            let n = part.rows.nrows();
            rows.rows_mut(offset, n).copy_from(&part.rows);
            offset += n;
        }

        Ok(Array { shape, rows })
    }

    /// Element-wise `self - other`.
    pub fn sub(&self, other: &Array) -> Result<Array, DataError> {
        if self.shape != other.shape {
            return Err(DataError::Concat(self.shape.clone(), other.shape.clone()));
        }

        Ok(Array {
            shape: self.shape.clone(),
            rows: &self.rows - &other.rows,
        })
    }

    pub fn mean_abs(&self) -> Option<f64> {
        if self.rows.is_empty() {
            return None;
        }
        Some(self.rows.abs().mean())
    }

    pub fn rms(&self) -> Option<f64> {
        if self.rows.is_empty() {
            return None;
        }
        Some((self.rows.norm_squared() / self.rows.len() as f64).sqrt())
    }
}

/// A single named quantity stored in a [`crate::DataEntity`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Scalar(f64),
    Array(Array),
}

impl Value {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Value::Scalar(value) => Some(*value),
            Value::Array(_) => None,
        }
    }

    pub fn as_array(&self) -> Option<&Array> {
        match self {
            Value::Array(array) => Some(array),
            Value::Scalar(_) => None,
        }
    }

    /// Slices along `axis`. Scalars and arrays without that axis are returned
    /// unchanged.
    pub(crate) fn select(&self, axis: usize, indices: &[usize]) -> Result<Value, DataError> {
        match self {
            Value::Array(array) if array.ndim() > axis => {
                Ok(Value::Array(array.select(axis, indices)?))
            }
            other => Ok(other.clone()),
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Scalar(value)
    }
}

impl From<Array> for Value {
    fn from(value: Array) -> Self {
        Value::Array(value)
    }
}
