//! Parameter registry
//!
//! Parameters are registered once, in a fixed order, together with their
//! parallelism role. Anything that needs to treat a class of parameters
//! differently (the sequence-parallel gradient reduction, weight-decay
//! grouping, sharded optimizers) reads the registry rather than inspecting
//! optimizer state.

use crate::error::ModelError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Name fragments excluded from weight decay.
const NO_DECAY: [&str; 2] = ["bias", "norm"];

/// How a parameter is laid out across tensor-parallel ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParallelRole {
    /// Identical on every rank; gradients are complete locally.
    Replicated,
    /// Replicated, but each rank only sees its slice of the sequence, so the
    /// local gradient is partial and must be summed over the tensor-parallel group.
    SequenceParallel,
}

/// A named parameter and its gradient.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
    pub grad: Vec<f32>,
    pub role: ParallelRole,
}

impl Parameter {
    pub fn new(
        name: impl Into<String>,
        shape: Vec<usize>,
        data: Vec<f32>,
        role: ParallelRole,
    ) -> Result<Self, ModelError> {
        let name = name.into();
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(ModelError::ShapeMismatch {
                name,
                expected,
                got: data.len(),
            });
        }
        let grad = vec![0.0; data.len()];
        Ok(Self {
            name,
            shape,
            data,
            grad,
            role,
        })
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Whether this parameter belongs to the decay-free group.
    pub fn no_weight_decay(&self) -> bool {
        no_weight_decay(&self.name)
    }
}

/// Biases and normalization gains are not decayed.
pub fn no_weight_decay(name: &str) -> bool {
    NO_DECAY.iter().any(|fragment| name.contains(fragment))
}

/// Ordered collection of parameters with lookup by name.
#[derive(Debug, Clone, Default)]
pub struct ParamRegistry {
    params: Vec<Parameter>,
    index: HashMap<String, usize>,
}

impl ParamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a parameter and return its slot.
    pub fn register(&mut self, param: Parameter) -> Result<usize, ModelError> {
        if self.index.contains_key(&param.name) {
            return Err(ModelError::DuplicateParameter(param.name));
        }
        let slot = self.params.len();
        self.index.insert(param.name.clone(), slot);
        self.params.push(param);
        Ok(slot)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Total number of scalar parameters.
    pub fn numel(&self) -> usize {
        self.params.iter().map(Parameter::numel).sum()
    }

    pub fn slot(&self, slot: usize) -> &Parameter {
        &self.params[slot]
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.index.get(name).map(|&slot| &self.params[slot])
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Parameter> {
        self.index.get(name).map(|&slot| &mut self.params[slot])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.params.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Parameter> {
        self.params.iter_mut()
    }

    /// Parameters carrying `role`, in registration order.
    pub fn with_role_mut(&mut self, role: ParallelRole) -> impl Iterator<Item = &mut Parameter> {
        self.params.iter_mut().filter(move |p| p.role == role)
    }

    pub fn zero_grad(&mut self) {
        for param in &mut self.params {
            param.grad.iter_mut().for_each(|g| *g = 0.0);
        }
    }

    /// Global L2 norm of all gradients.
    pub fn grad_norm(&self) -> f64 {
        self.grad_sq_sum().sqrt()
    }

    /// Sum of squared gradient entries.
    pub fn grad_sq_sum(&self) -> f64 {
        self.params
            .iter()
            .flat_map(|p| p.grad.iter())
            .map(|&g| (g as f64) * (g as f64))
            .sum()
    }

    /// All parameter values concatenated in registration order.
    pub fn flatten_data(&self) -> Vec<f32> {
        self.params.iter().flat_map(|p| p.data.iter().copied()).collect()
    }

    /// All gradients concatenated in registration order.
    pub fn flatten_grads(&self) -> Vec<f32> {
        self.params.iter().flat_map(|p| p.grad.iter().copied()).collect()
    }

    /// Per-element decay mask matching [`ParamRegistry::flatten_data`].
    pub fn flatten_decay_mask(&self) -> Vec<bool> {
        self.params
            .iter()
            .flat_map(|p| std::iter::repeat(!p.no_weight_decay()).take(p.numel()))
            .collect()
    }

    /// Overwrite parameter values from a flat buffer.
    ///
    /// Extra trailing elements (padding) are ignored.
    pub fn scatter_data(&mut self, flat: &[f32]) -> Result<(), ModelError> {
        self.check_flat(flat.len())?;
        let mut offset = 0;
        for param in &mut self.params {
            let n = param.numel();
            param.data.copy_from_slice(&flat[offset..offset + n]);
            offset += n;
        }
        Ok(())
    }

    /// Overwrite gradients from a flat buffer.
    pub fn scatter_grads(&mut self, flat: &[f32]) -> Result<(), ModelError> {
        self.check_flat(flat.len())?;
        let mut offset = 0;
        for param in &mut self.params {
            let n = param.numel();
            param.grad.copy_from_slice(&flat[offset..offset + n]);
            offset += n;
        }
        Ok(())
    }

    fn check_flat(&self, len: usize) -> Result<(), ModelError> {
        let expected = self.numel();
        if len < expected {
            return Err(ModelError::FlatLength { expected, got: len });
        }
        Ok(())
    }

    /// Copy of every parameter's values keyed by name.
    pub fn state_dict(&self) -> Vec<(String, Vec<usize>, Vec<f32>)> {
        self.params
            .iter()
            .map(|p| (p.name.clone(), p.shape.clone(), p.data.clone()))
            .collect()
    }

    /// Load values by name. Every registered parameter must be present.
    pub fn load_state_dict(
        &mut self,
        tensors: &HashMap<String, Vec<f32>>,
    ) -> Result<(), ModelError> {
        for param in &mut self.params {
            let values = tensors
                .get(&param.name)
                .ok_or_else(|| ModelError::UnknownParameter(param.name.clone()))?;
            if values.len() != param.numel() {
                return Err(ModelError::ShapeMismatch {
                    name: param.name.clone(),
                    expected: param.numel(),
                    got: values.len(),
                });
            }
            param.data.copy_from_slice(values);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ParamRegistry {
        let mut reg = ParamRegistry::new();
        reg.register(
            Parameter::new("layer.weight", vec![2, 2], vec![1.0, 2.0, 3.0, 4.0], ParallelRole::Replicated)
                .unwrap(),
        )
        .unwrap();
        reg.register(
            Parameter::new("layer.norm.weight", vec![2], vec![1.0, 1.0], ParallelRole::SequenceParallel)
                .unwrap(),
        )
        .unwrap();
        reg
    }

    #[test]
    fn test_no_weight_decay_names() {
        assert!(no_weight_decay("lm_head.bias"));
        assert!(no_weight_decay("model.norm.weight"));
        assert!(!no_weight_decay("model.embed_tokens.weight"));
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut reg = registry();
        let dup = Parameter::new("layer.weight", vec![1], vec![0.0], ParallelRole::Replicated).unwrap();
        assert!(matches!(reg.register(dup), Err(ModelError::DuplicateParameter(_))));
    }

    #[test]
    fn test_flatten_and_scatter() {
        let mut reg = registry();
        assert_eq!(reg.numel(), 6);
        assert_eq!(reg.flatten_decay_mask(), vec![true, true, true, true, false, false]);

        let padded = vec![9.0, 8.0, 7.0, 6.0, 5.0, 4.0, 0.0, 0.0];
        reg.scatter_grads(&padded).unwrap();
        assert_eq!(reg.flatten_grads(), padded[..6].to_vec());
        assert!(reg.scatter_grads(&[1.0]).is_err());

        let sp: Vec<String> = reg
            .with_role_mut(ParallelRole::SequenceParallel)
            .map(|p| p.name.clone())
            .collect();
        assert_eq!(sp, vec!["layer.norm.weight".to_string()]);

        reg.zero_grad();
        assert_eq!(reg.grad_norm(), 0.0);
    }

    #[test]
    fn test_parameter_shape_checked() {
        assert!(Parameter::new("w", vec![3, 3], vec![0.0; 8], ParallelRole::Replicated).is_err());
    }
}
