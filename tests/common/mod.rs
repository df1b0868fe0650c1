#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use ffscope::{Array, Blueprint, Environment, FnModel, MemoryDataset, Prediction, Settings};

pub const EPSILON: f64 = 1e-12;

pub fn settings(threaded: bool) -> Settings {
    Settings {
        threaded,
        visual: false,
        tick_interval_ms: 1,
        ..Default::default()
    }
}

pub fn environment(threaded: bool) -> Environment {
    let mut blueprint = Blueprint::with_builtins();
    blueprint.settings(settings(threaded));
    blueprint.finish().unwrap()
}

/// Three configurations of two atoms. Every coordinate of configuration `i`
/// equals `i`.
pub fn coordinates() -> Array {
    let data = (0..3).flat_map(|i| std::iter::repeat_n(i as f64, 6)).collect();
    Array::new(vec![3, 2, 3], data).unwrap()
}

/// Reference energies `[0, 5, 12]` and zero forces.
pub fn dataset() -> MemoryDataset {
    MemoryDataset::new(
        "water",
        vec![8, 1],
        coordinates(),
        Some(Array::from_vec(vec![0.0, 5.0, 12.0])),
        Some(Array::zeros(vec![3, 2, 3])),
    )
    .unwrap()
}

/// The same configurations without reference data.
pub fn unlabeled_dataset() -> MemoryDataset {
    MemoryDataset::new("unlabeled", vec![8, 1], coordinates(), None, None).unwrap()
}

/// Energy is the sum of all coordinates, forces are their negation.
pub fn linear_model(fingerprint: &str, calls: Arc<AtomicUsize>) -> FnModel {
    FnModel::new("linear", fingerprint, move |coordinates: &Array, _: &[u32]| {
        calls.fetch_add(1, Ordering::SeqCst);

        let energies = (0..coordinates.len_of(0))
            .map(|i| {
                let points = coordinates.points(i).unwrap_or_default();
                points.iter().map(|p| p.coords.sum()).sum::<f64>()
            })
            .collect();

        Ok(Prediction {
            energies: Some(Array::from_vec(energies)),
            forces: Some(coordinates.map(|x| -x)),
        })
    })
}

pub fn scalar(env: &Environment, data_type: &str, model: &str, dataset: &str) -> f64 {
    env.get_data(data_type, Some(model), Some(dataset))
        .unwrap()
        .get("value")
        .unwrap()
        .as_scalar()
        .unwrap()
}
