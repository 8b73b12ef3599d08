use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::CatalogError;
use crate::types::{Derivation, DerivationOp, IndicatorDefinition};

/// Derived indicators in dependency order. Built once per catalog; evaluation
/// is a pure function of the base values handed in.
#[derive(Debug, Clone, Default)]
pub struct DerivationPlan {
    steps: Vec<(String, Derivation)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DerivedValue {
    Value(f64),
    /// Inputs were present but the formula has no value (e.g. ratio over zero).
    Undefined(String),
}

impl DerivationPlan {
    pub fn build<'a, I>(definitions: I) -> Result<Self, CatalogError>
    where
        I: IntoIterator<Item = &'a IndicatorDefinition>,
    {
        let definitions: Vec<&IndicatorDefinition> = definitions.into_iter().collect();
        let known: BTreeSet<&str> = definitions.iter().map(|def| def.id.as_str()).collect();

        let mut formulas: BTreeMap<&str, &Derivation> = BTreeMap::new();
        for def in &definitions {
            let Some(derivation) = def.derivation.as_ref() else {
                continue;
            };
            validate_shape(&def.id, derivation)?;
            for input in &derivation.inputs {
                if !known.contains(input.as_str()) {
                    return Err(CatalogError::UnknownDerivationInput {
                        indicator: def.id.clone(),
                        input: input.clone(),
                    });
                }
            }
            formulas.insert(def.id.as_str(), derivation);
        }

        // Kahn's algorithm over derived -> derived edges; base inputs are sources.
        let mut pending: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for (id, derivation) in &formulas {
            let derived_inputs: BTreeSet<&str> = derivation
                .inputs
                .iter()
                .map(String::as_str)
                .filter(|input| formulas.contains_key(input))
                .collect();
            pending.insert(*id, derived_inputs.len());
            for input in derived_inputs {
                dependents.entry(input).or_default().push(*id);
            }
        }

        let mut ready: BTreeSet<&str> = pending
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut steps = Vec::with_capacity(formulas.len());
        while let Some(id) = ready.pop_first() {
            pending.remove(id);
            steps.push((id.to_string(), formulas[id].clone()));
            for dependent in dependents.get(id).into_iter().flatten() {
                if let Some(count) = pending.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(*dependent);
                    }
                }
            }
        }

        if !pending.is_empty() {
            return Err(CatalogError::DerivationCycle(
                pending.keys().map(|id| id.to_string()).collect(),
            ));
        }
        Ok(Self { steps })
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn order(&self) -> Vec<&str> {
        self.steps.iter().map(|(id, _)| id.as_str()).collect()
    }

    /// Evaluates every derivable indicator for one (basin, timestamp) group.
    /// Indicators with a missing input are skipped; results feed later steps.
    pub fn evaluate(&self, base: &BTreeMap<String, f64>) -> Vec<(String, DerivedValue)> {
        let mut values = base.clone();
        let mut results = Vec::new();
        for (id, derivation) in &self.steps {
            if values.contains_key(id) {
                continue;
            }
            let inputs: Option<Vec<f64>> = derivation
                .inputs
                .iter()
                .map(|input| values.get(input).copied())
                .collect();
            let Some(inputs) = inputs else {
                continue;
            };
            let outcome = apply(derivation.op, &inputs);
            if let DerivedValue::Value(value) = outcome {
                values.insert(id.clone(), value);
            }
            results.push((id.clone(), outcome));
        }
        results
    }
}

fn validate_shape(indicator: &str, derivation: &Derivation) -> Result<(), CatalogError> {
    let arity_ok = match derivation.op {
        DerivationOp::Difference | DerivationOp::Ratio => derivation.inputs.len() == 2,
        DerivationOp::Sum | DerivationOp::Product => !derivation.inputs.is_empty(),
    };
    if !arity_ok {
        return Err(CatalogError::InvalidDerivation {
            indicator: indicator.to_string(),
            message: format!(
                "{} takes {} inputs, got {}",
                derivation.op.as_str(),
                match derivation.op {
                    DerivationOp::Difference | DerivationOp::Ratio => "exactly 2",
                    _ => "at least 1",
                },
                derivation.inputs.len()
            ),
        });
    }
    if derivation.inputs.iter().any(|input| input == indicator) {
        return Err(CatalogError::DerivationCycle(vec![indicator.to_string()]));
    }
    Ok(())
}

fn apply(op: DerivationOp, inputs: &[f64]) -> DerivedValue {
    let value = match op {
        DerivationOp::Sum => inputs.iter().sum(),
        DerivationOp::Product => inputs.iter().product(),
        DerivationOp::Difference => inputs[0] - inputs[1],
        DerivationOp::Ratio => {
            if inputs[1] == 0.0 {
                return DerivedValue::Undefined("ratio denominator is zero".to_string());
            }
            inputs[0] / inputs[1]
        }
    };
    if value.is_finite() {
        DerivedValue::Value(value)
    } else {
        DerivedValue::Undefined(format!("{} produced a non-finite value", op.as_str()))
    }
}
