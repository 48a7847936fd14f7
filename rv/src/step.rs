//! RendezvousStep - a validated declaration of "I need N of us at point X"

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::RendezvousError;
use crate::registry::{Arrival, BarrierRegistry};
use crate::waiter::WaiterHandle;

/// A rendezvous point declaration
///
/// Construction rejects an empty name or a zero quorum, so invalid
/// declarations never reach the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "StepDeclaration")]
pub struct RendezvousStep {
    name: String,
    quorum: u32,
}

#[derive(Deserialize)]
struct StepDeclaration {
    name: String,
    quorum: u32,
}

impl TryFrom<StepDeclaration> for RendezvousStep {
    type Error = RendezvousError;

    fn try_from(declaration: StepDeclaration) -> Result<Self, Self::Error> {
        Self::new(declaration.name, declaration.quorum)
    }
}

impl RendezvousStep {
    pub fn new(name: impl Into<String>, quorum: u32) -> Result<Self, RendezvousError> {
        let name = name.into();
        if name.is_empty() {
            return Err(RendezvousError::EmptyName);
        }
        if quorum < 1 {
            return Err(RendezvousError::InvalidQuorum(quorum));
        }
        Ok(Self { name, quorum })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn quorum(&self) -> u32 {
        self.quorum
    }

    /// Enter this rendezvous point on the given registry
    pub fn enter(
        &self,
        registry: &BarrierRegistry,
        waiter_id: &str,
        handle: Arc<dyn WaiterHandle>,
    ) -> Result<Arrival, RendezvousError> {
        registry.enter(self, waiter_id, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_step() {
        let step = RendezvousStep::new("deploy", 3).unwrap();
        assert_eq!(step.name(), "deploy");
        assert_eq!(step.quorum(), 3);
    }

    #[test]
    fn test_rejects_empty_name() {
        assert_eq!(RendezvousStep::new("", 2), Err(RendezvousError::EmptyName));
    }

    #[test]
    fn test_rejects_zero_quorum() {
        assert_eq!(RendezvousStep::new("deploy", 0), Err(RendezvousError::InvalidQuorum(0)));
    }

    #[test]
    fn test_quorum_of_one_is_valid() {
        assert!(RendezvousStep::new("solo", 1).is_ok());
    }

    #[test]
    fn test_deserialize_validates() {
        let step: RendezvousStep = serde_json::from_str(r#"{"name":"p","quorum":2}"#).unwrap();
        assert_eq!(step, RendezvousStep::new("p", 2).unwrap());

        assert!(serde_json::from_str::<RendezvousStep>(r#"{"name":"","quorum":2}"#).is_err());
        assert!(serde_json::from_str::<RendezvousStep>(r#"{"name":"p","quorum":0}"#).is_err());
    }
}
