//! Compiled-graph metadata
//!
//! S_GRAPH hands the session the address-vector table of the compiled
//! network; queue targets and parameters are validated against it.

use crate::buffer::Direction;
use crate::error::{Error, Result};
use crate::MAX_ADDR_VECTOR;

/// Role of an address-vector slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// Input feature map
    Input,
    /// Output feature map
    Output,
    /// Weights and biases
    Weight,
    /// Intermediate scratch
    Temp,
}

impl MemoryKind {
    /// Kind of slot fed by a queue direction
    pub fn for_direction(direction: Direction) -> Self {
        match direction {
            Direction::Input => MemoryKind::Input,
            Direction::Output => MemoryKind::Output,
        }
    }
}

/// One address-vector slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressVector {
    pub index: u32,
    pub kind: MemoryKind,
    pub size: usize,
}

/// S_GRAPH request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphDesc {
    pub id: u32,
    pub address_vectors: Vec<AddressVector>,
}

impl GraphDesc {
    pub fn validate(&self) -> Result<()> {
        let count = self.address_vectors.len();
        if count == 0 {
            return Err(Error::InvalidArgument("graph without address vectors".into()));
        }
        if count > MAX_ADDR_VECTOR {
            return Err(Error::ResourceExhausted {
                what: "address vectors",
                limit: MAX_ADDR_VECTOR,
            });
        }

        for (i, av) in self.address_vectors.iter().enumerate() {
            if self.address_vectors[..i].iter().any(|o| o.index == av.index) {
                return Err(Error::InvalidArgument(format!(
                    "address vector {} declared twice",
                    av.index
                )));
            }
        }

        for kind in [MemoryKind::Input, MemoryKind::Output] {
            if !self.address_vectors.iter().any(|av| av.kind == kind) {
                return Err(Error::InvalidArgument(format!(
                    "graph has no {:?} address vector",
                    kind
                )));
            }
        }
        Ok(())
    }

    pub fn find(&self, index: u32) -> Option<&AddressVector> {
        self.address_vectors.iter().find(|av| av.index == index)
    }

    /// Check that `target` names a slot of the kind a queue direction feeds
    pub fn check_target(&self, target: u32, direction: Direction) -> Result<()> {
        let expected = MemoryKind::for_direction(direction);
        match self.find(target) {
            Some(av) if av.kind == expected => Ok(()),
            Some(av) => Err(Error::InvalidArgument(format!(
                "target {} is a {:?} vector, {:?} expected",
                target, av.kind, expected
            ))),
            None => Err(Error::InvalidArgument(format!(
                "target {} is not in the graph",
                target
            ))),
        }
    }
}

/// One S_PARAM entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    /// Address-vector index the parameter patches
    pub target: u32,
    pub offset: u32,
    pub size: u32,
    pub value: u64,
}

/// S_PARAM request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamList {
    pub params: Vec<Param>,
}

/// S_CTRL request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Control {
    pub id: u32,
    pub value: u32,
}
