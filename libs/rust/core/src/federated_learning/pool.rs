//! Simulated client population.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// Opaque handle of one simulated client, stable for the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub u32);

impl ClientId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fixed population of client identities, `0..n`.
///
/// The pool never holds client data; collaborators key their partitions by
/// [`ClientId`]. Optional per-client weights feed weighted sampling.
#[derive(Debug, Clone)]
pub struct ClientPool {
    ids: Vec<ClientId>,
    weights: Option<Vec<f64>>,
}

impl ClientPool {
    pub fn new(size: usize) -> Result<Self, ConfigurationError> {
        if size == 0 {
            return Err(ConfigurationError::EmptyPopulation);
        }
        Ok(Self { ids: (0..size as u32).map(ClientId).collect(), weights: None })
    }

    /// Population sized by `weights`, one weight per client (e.g. local example count).
    pub fn with_weights(weights: Vec<f64>) -> Result<Self, ConfigurationError> {
        let mut pool = Self::new(weights.len())?;
        for (i, w) in weights.iter().enumerate() {
            if !w.is_finite() || *w <= 0.0 {
                return Err(ConfigurationError::InvalidWeight { client: ClientId(i as u32), weight: *w });
            }
        }
        pool.weights = Some(weights);
        Ok(pool)
    }

    pub fn ids(&self) -> &[ClientId] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: ClientId) -> bool {
        id.index() < self.ids.len()
    }

    pub fn weight(&self, id: ClientId) -> Option<f64> {
        self.weights.as_ref().and_then(|w| w.get(id.index()).copied())
    }

    pub fn has_weights(&self) -> bool {
        self.weights.is_some()
    }
}
