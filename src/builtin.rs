//! The standard force-field data types: predictions, their errors against
//! the reference data, and scalar error aggregates.
//!
//! | key            | depends on     | field    |
//! |----------------|----------------|----------|
//! | `energy`       |                | `energy` |
//! | `forces`       |                | `forces` |
//! | `energy_error` | `energy`       | `error`  |
//! | `forces_error` | `forces`       | `error`  |
//! | `energy_mae`   | `energy_error` | `value`  |
//! | `energy_rmse`  | `energy_error` | `value`  |
//! | `forces_mae`   | `forces_error` | `value`  |
//! | `forces_rmse`  | `forces_error` | `value`  |

use std::collections::BTreeMap;

use anyhow::{Context, anyhow};

use crate::array::{Array, Value};
use crate::blueprint::Blueprint;
use crate::engine::ProduceContext;

pub const ENERGY: &str = "energy";
pub const FORCES: &str = "forces";
pub const ENERGY_ERROR: &str = "energy_error";
pub const FORCES_ERROR: &str = "forces_error";
pub const ENERGY_MAE: &str = "energy_mae";
pub const ENERGY_RMSE: &str = "energy_rmse";
pub const FORCES_MAE: &str = "forces_mae";
pub const FORCES_RMSE: &str = "forces_rmse";

pub const ERROR_FIELD: &str = "error";
pub const VALUE_FIELD: &str = "value";

pub fn register(blueprint: &mut Blueprint) {
    blueprint
        .data_type(ENERGY)
        .name("Energy")
        .iterable(true)
        .atom_constant(true)
        .produce(|ctx| predict(ctx, Quantity::Energy));

    blueprint
        .data_type(FORCES)
        .name("Forces")
        .iterable(true)
        .atom_filterable(true)
        .produce(|ctx| predict(ctx, Quantity::Forces));

    blueprint
        .data_type(ENERGY_ERROR)
        .name("Energy error")
        .depends_on([ENERGY])
        .iterable(true)
        .atom_constant(true)
        .produce(|ctx| error(ctx, Quantity::Energy));

    blueprint
        .data_type(FORCES_ERROR)
        .name("Forces error")
        .depends_on([FORCES])
        .iterable(true)
        .atom_filterable(true)
        .produce(|ctx| error(ctx, Quantity::Forces));

    blueprint
        .data_type(ENERGY_MAE)
        .name("Energy MAE")
        .depends_on([ENERGY_ERROR])
        .produce(|ctx| aggregate(ctx, ENERGY_ERROR, Array::mean_abs));

    blueprint
        .data_type(ENERGY_RMSE)
        .name("Energy RMSE")
        .depends_on([ENERGY_ERROR])
        .produce(|ctx| aggregate(ctx, ENERGY_ERROR, Array::rms));

    blueprint
        .data_type(FORCES_MAE)
        .name("Forces MAE")
        .depends_on([FORCES_ERROR])
        .produce(|ctx| aggregate(ctx, FORCES_ERROR, Array::mean_abs));

    blueprint
        .data_type(FORCES_RMSE)
        .name("Forces RMSE")
        .depends_on([FORCES_ERROR])
        .produce(|ctx| aggregate(ctx, FORCES_ERROR, Array::rms));
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Quantity {
    Energy,
    Forces,
}

impl Quantity {
    fn key(self) -> &'static str {
        match self {
            Quantity::Energy => ENERGY,
            Quantity::Forces => FORCES,
        }
    }
}

fn single(field: &str, array: Array) -> BTreeMap<String, Value> {
    BTreeMap::from([(field.to_string(), Value::Array(array))])
}

/// Evaluates the model batch by batch, checking for cancellation between
/// batches. A model that predicts both quantities in one pass publishes
/// both.
fn predict(ctx: &mut ProduceContext, quantity: Quantity) -> anyhow::Result<bool> {
    let dataset = ctx.dataset()?;
    let model = ctx.model()?;

    let both = model.single_predict();
    let want_energy = both || quantity == Quantity::Energy;
    let want_forces = both || quantity == Quantity::Forces;

    let elements = dataset.elements();
    let total = dataset.len();
    let batch = ctx.batch_size();

    let mut energies = Vec::new();
    let mut forces = Vec::new();

    for start in (0..total).step_by(batch) {
        if !ctx.is_running() {
            return Ok(false);
        }

        let end = (start + batch).min(total);
        let indices: Vec<usize> = (start..end).collect();
        let coordinates = dataset.coordinates(Some(&indices))?;

        let prediction = model
            .predict(&coordinates, &elements)
            .with_context(|| format!("Model '{}' failed on configurations {start}..{end}", model.name()))?;

        if want_energy {
            energies.push(
                prediction
                    .energies
                    .ok_or_else(|| anyhow!("Model '{}' didn't predict energies", model.name()))?,
            );
        }
        if want_forces {
            forces.push(
                prediction
                    .forces
                    .ok_or_else(|| anyhow!("Model '{}' didn't predict forces", model.name()))?,
            );
        }

        ctx.set_progress(total, end, Some("Predicting"), true);
    }

    if !ctx.is_running() {
        return Ok(false);
    }

    let n_atoms = dataset.n_atoms();
    let joined = |parts: &[Array], empty: Vec<usize>| -> anyhow::Result<Array> {
        if parts.is_empty() {
            Ok(Array::zeros(empty))
        } else {
            Ok(Array::concat(parts)?)
        }
    };

    let energy = want_energy
        .then(|| joined(&energies, vec![0]))
        .transpose()?;
    let force = want_forces
        .then(|| joined(&forces, vec![0, n_atoms, 3]))
        .transpose()?;

    for (kind, array) in [(Quantity::Energy, energy), (Quantity::Forces, force)] {
        let Some(array) = array else { continue };
        let data = single(kind.key(), array);
        if kind == quantity {
            ctx.publish(data);
        } else {
            ctx.publish_as(kind.key(), data)?;
        }
    }

    Ok(true)
}

/// Prediction minus reference.
fn error(ctx: &mut ProduceContext, quantity: Quantity) -> anyhow::Result<bool> {
    let dataset = ctx.dataset()?;

    let predicted = ctx.dependency(quantity.key())?.get(quantity.key())?;
    let predicted = predicted
        .as_array()
        .ok_or_else(|| anyhow!("'{}' is not an array", quantity.key()))?;

    let reference = match quantity {
        Quantity::Energy => dataset.energies(None)?,
        Quantity::Forces => dataset.forces(None)?,
    }
    .ok_or_else(|| {
        anyhow!(
            "Dataset '{}' has no reference {}",
            dataset.name(),
            quantity.key()
        )
    })?;

    let error = predicted.sub(&reference)?;
    ctx.publish(single(ERROR_FIELD, error));
    Ok(true)
}

fn aggregate(
    ctx: &mut ProduceContext,
    dependency: &str,
    reduce: fn(&Array) -> Option<f64>,
) -> anyhow::Result<bool> {
    let error = ctx.dependency(dependency)?.get(ERROR_FIELD)?;
    let error = error
        .as_array()
        .ok_or_else(|| anyhow!("'{dependency}' is not an array"))?;

    let value = reduce(error).ok_or_else(|| anyhow!("'{dependency}' is empty"))?;
    ctx.publish(BTreeMap::from([(VALUE_FIELD.to_string(), Value::Scalar(value))]));
    Ok(true)
}
