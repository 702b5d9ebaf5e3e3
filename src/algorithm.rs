use std::{collections::HashMap, sync::Arc};

use crate::{
    error::{JobError, Result},
    models::{DataSet, Model, TrainedModel},
};

/// A trainable algorithm. Training is CPU bound, so it runs on a blocking worker thread.
pub trait Algorithm: Send + Sync {
    fn name(&self) -> &str;

    fn train(&self, model: &Model, dataset: &DataSet) -> Result<TrainedModel>;
}

#[derive(Clone, Default)]
pub struct AlgorithmRegistry {
    algorithms: HashMap<String, Arc<dyn Algorithm>>,
}

impl AlgorithmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, algorithm: Arc<dyn Algorithm>) {
        self.algorithms
            .insert(algorithm.name().to_string(), algorithm);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Algorithm>> {
        self.algorithms
            .get(name)
            .cloned()
            .ok_or_else(|| JobError::Validation(format!("algorithm not supported: {name}")))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.algorithms.keys().cloned().collect();
        names.sort();
        names
    }
}
