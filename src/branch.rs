//! Cross references between branching instructions and their targets.

use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Display, Formatter};

use crate::instruction::Instruction;


/// Maps target addresses to the addresses of the instructions that branch or
/// refer to them.
///
/// Only pairs where both ends were decoded in the same pass are recorded. The
/// sources of a target keep the order in which they were recorded and contain
/// no duplicates.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct BranchMap {
    targets: BTreeMap<u64, Vec<u64>>,
}

impl BranchMap {
    /// Create an empty branch map.
    pub fn new() -> BranchMap {
        BranchMap::default()
    }

    /// Build the map for a complete instruction sequence by indexing the
    /// instructions by address.
    pub fn from_instructions(instructions: &[Instruction]) -> BranchMap {
        let addresses: HashMap<u64, usize> = instructions.iter()
            .enumerate()
            .map(|(i, inst)| (inst.address, i))
            .collect();

        let mut map = BranchMap::new();
        for inst in instructions {
            if let Some(destination) = inst.destination() {
                if addresses.contains_key(&destination) {
                    map.insert(destination, inst.address);
                }
            }
        }
        map
    }

    /// Record that the instruction at `source` refers to `target`. Returns
    /// whether the pair was new.
    pub fn insert(&mut self, target: u64, source: u64) -> bool {
        let sources = self.targets.entry(target).or_insert_with(Vec::new);
        if sources.contains(&source) {
            false
        } else {
            sources.push(source);
            true
        }
    }

    /// The instructions referring to `target`.
    pub fn sources(&self, target: u64) -> &[u64] {
        self.targets.get(&target).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether the instruction at `source` refers to `target`.
    pub fn contains(&self, source: u64, target: u64) -> bool {
        self.sources(target).contains(&source)
    }

    /// Whether any in-range instruction refers to `target`.
    pub fn is_target(&self, target: u64) -> bool {
        !self.sources(target).is_empty()
    }

    /// Iterate over all targets with their sources in ascending target order.
    pub fn iter(&self) -> impl Iterator<Item=(u64, &[u64])> {
        self.targets.iter().map(|(&target, sources)| (target, sources.as_slice()))
    }

    /// The number of recorded (source, target) pairs.
    pub fn len(&self) -> usize {
        self.targets.values().map(Vec::len).sum()
    }

    /// Whether no pair was recorded.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

impl Display for BranchMap {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "BranchMap [")?;
        if !self.is_empty() {
            writeln!(f)?;
        }
        for (target, sources) in self.iter() {
            write!(f, "    {:x} <-", target)?;
            for source in sources {
                write!(f, " {:x}", source)?;
            }
            writeln!(f)?;
        }
        write!(f, "]")
    }
}

/// Builds a branch map incrementally while instructions are decoded in
/// ascending address order.
///
/// When an instruction is added, it is linked to its destination if that was
/// decoded already, and every earlier instruction waiting for its address is
/// linked to it. Both lookups go through tables, so the whole pass is linear.
#[derive(Debug, Default, Clone)]
pub struct BranchMapper {
    map: BranchMap,
    addresses: HashMap<u64, usize>,
    pending: HashMap<u64, Vec<u64>>,
}

impl BranchMapper {
    /// Create a new mapper.
    pub fn new() -> BranchMapper {
        BranchMapper::default()
    }

    /// Update the map for the last instruction of `decoded`. All earlier
    /// instructions must have been passed to this function before.
    pub fn push(&mut self, decoded: &[Instruction]) {
        let index = match decoded.len().checked_sub(1) {
            Some(index) => index,
            None => return,
        };
        let inst = &decoded[index];
        self.addresses.insert(inst.address, index);

        // Does the new instruction point to an older one (or itself)?
        if let Some(destination) = inst.destination() {
            if self.addresses.contains_key(&destination) {
                self.record(destination, inst.address);
            } else {
                self.pending.entry(destination).or_insert_with(Vec::new).push(inst.address);
            }
        }

        // Do older instructions point to the new one?
        if let Some(sources) = self.pending.remove(&inst.address) {
            for source in sources {
                self.record(inst.address, source);
            }
        }
    }

    /// Finish and return the map.
    pub fn finish(self) -> BranchMap {
        self.map
    }

    fn record(&mut self, target: u64, source: u64) {
        if self.map.insert(target, source) {
            tracing::trace!("branch {:#x} -> {:#x}", source, target);
        }
    }
}
