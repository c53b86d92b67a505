//! Abstract machine state
//!
//! An [`AbstractState`] maps every register to an abstract value, keeps the
//! memory cells written at known addresses and tracks the memory zones the
//! contracts declared. It is parameterized by the value type of a
//! [`ValueDomain`]; every operation receives the domain it should use.

use std::collections::BTreeMap;
use std::fmt;

use crate::contract::{Contract, ContractGraph, ContractIndex, Expression, Property, ZoneAction};
use crate::semantics::{BinaryOp, Relation, Truth, ValueDomain};

/// Most addresses a store may target before memory is forgotten altogether.
const WEAK_UPDATE_LIMIT: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryCell<V> {
    pub size: u8,
    pub value: V,
}

/// A named memory region
#[derive(Debug, Clone, PartialEq)]
pub struct Zone<V> {
    pub name: String,
    pub start: V,
    pub length: V,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AbstractState<V> {
    registers: Vec<V>,
    memory: BTreeMap<u64, MemoryCell<V>>,
    zones: Vec<Zone<V>>,
    bottom: bool,
}

fn mask(size: u8) -> u64 {
    match size {
        8 => u64::MAX,
        n => (1u64 << (u32::from(n) * 8)) - 1,
    }
}

impl<V: Clone + PartialEq> AbstractState<V> {
    /// State where every register is unknown and nothing is known of memory.
    pub fn new<D: ValueDomain<Value = V>>(register_count: usize, domain: &D) -> Self {
        Self {
            registers: vec![domain.top(); register_count],
            memory: BTreeMap::new(),
            zones: Vec::new(),
            bottom: false,
        }
    }

    /// State before the first instruction of a block leaving `index`: the
    /// dominator chain is assumed root-first, then the contract itself.
    pub fn for_contract<D: ValueDomain<Value = V>>(
        graph: &ContractGraph,
        index: ContractIndex,
        register_count: usize,
        domain: &D,
    ) -> Self {
        let mut state = Self::new(register_count, domain);
        for link in graph.dominator_chain(index) {
            state.assume_contract(graph.contract(link), domain);
        }
        state
    }

    /// True if no concrete state satisfies what was assumed.
    pub fn is_bottom(&self) -> bool {
        self.bottom
    }

    pub fn set_bottom(&mut self) {
        self.bottom = true;
    }

    pub fn register_count(&self) -> usize {
        self.registers.len()
    }

    pub fn register(&self, index: usize) -> Option<&V> {
        self.registers.get(index)
    }

    pub fn set_register(&mut self, index: usize, value: V) {
        if let Some(slot) = self.registers.get_mut(index) {
            *slot = value;
        }
    }

    pub fn havoc_register<D: ValueDomain<Value = V>>(&mut self, index: usize, domain: &D) {
        self.set_register(index, domain.top());
    }

    pub fn memory(&self) -> impl Iterator<Item = (u64, &MemoryCell<V>)> {
        self.memory.iter().map(|(&address, cell)| (address, cell))
    }

    /// Forget everything known about memory.
    pub fn havoc_memory(&mut self) {
        self.memory.clear();
    }

    pub fn zones(&self) -> &[Zone<V>] {
        &self.zones
    }

    pub fn zone(&self, name: &str) -> Option<&Zone<V>> {
        self.zones.iter().find(|z| z.name == name)
    }

    fn remove_overlapping(&mut self, address: u64, size: u8) {
        let end = address.saturating_add(u64::from(size));
        // Cells are at most 8 bytes long
        let first = address.saturating_sub(7);
        let overlapping: Vec<u64> = self
            .memory
            .range(first..end)
            .filter(|(&start, cell)| start.saturating_add(u64::from(cell.size)) > address)
            .map(|(&start, _)| start)
            .collect();
        for start in overlapping {
            self.memory.remove(&start);
        }
    }

    /// Read `size` bytes at `address`.
    pub fn load<D: ValueDomain<Value = V>>(&self, address: &V, size: u8, domain: &D) -> V {
        let Some(address) = domain.as_constant(address) else {
            return domain.top();
        };
        match self.memory.get(&address) {
            Some(cell) if cell.size == size => cell.value.clone(),
            // Little-endian: a narrower read at the same address sees the low bytes
            Some(cell) if cell.size > size => match domain.as_constant(&cell.value) {
                Some(value) => domain.constant(value & mask(size)),
                None => domain.range(0, mask(size)),
            },
            _ => domain.top(),
        }
    }

    /// Write `value` to `size` bytes at `address`.
    ///
    /// A store to one known address replaces what was there. A store to a few
    /// possible addresses weakens each of them, and a store to an unbounded
    /// address forgets all of memory.
    pub fn store<D: ValueDomain<Value = V>>(&mut self, address: &V, size: u8, value: V, domain: &D) {
        let value = if size < 8 {
            domain.arithmetic(BinaryOp::And, &value, &domain.constant(mask(size)))
        } else {
            value
        };

        match domain.enumerate(address, WEAK_UPDATE_LIMIT) {
            Some(addresses) if addresses.len() == 1 => {
                let address = addresses[0];
                self.remove_overlapping(address, size);
                self.memory.insert(address, MemoryCell { size, value });
            }
            Some(addresses) => {
                for address in addresses {
                    let joined = match self.memory.get(&address) {
                        Some(cell) if cell.size == size => Some(domain.join(&cell.value, &value)),
                        _ => None,
                    };
                    self.remove_overlapping(address, size);
                    if let Some(value) = joined {
                        self.memory.insert(address, MemoryCell { size, value });
                    }
                }
            }
            None => self.havoc_memory(),
        }
    }

    pub fn eval<D: ValueDomain<Value = V>>(&self, expression: &Expression, domain: &D) -> V {
        match expression {
            Expression::Register { index, .. } => self
                .register(*index)
                .cloned()
                .unwrap_or_else(|| domain.top()),
            Expression::Zone(name) => self
                .zone(name)
                .map(|z| z.start.clone())
                .unwrap_or_else(|| domain.top()),
            Expression::Load { address, size } => {
                self.load(&self.eval(address, domain), *size, domain)
            }
            Expression::Constant(value) => domain.constant(*value),
            Expression::Range { min, max } => domain.range(*min, *max),
            Expression::Binary { op, lhs, rhs } => {
                domain.arithmetic(*op, &self.eval(lhs, domain), &self.eval(rhs, domain))
            }
        }
    }

    /// Replace the value of a register or memory location.
    fn write_location<D: ValueDomain<Value = V>>(
        &mut self,
        location: &Expression,
        value: V,
        domain: &D,
    ) {
        match location {
            Expression::Register { index, .. } => self.set_register(*index, value),
            Expression::Load { address, size } => {
                let address = self.eval(address, domain);
                if domain.as_constant(&address).is_some() {
                    self.store(&address, *size, value, domain);
                }
            }
            _ => {}
        }
    }

    /// Forget what is known about a register or memory location.
    pub fn havoc_location<D: ValueDomain<Value = V>>(&mut self, location: &Expression, domain: &D) {
        match location {
            Expression::Register { index, .. } => self.havoc_register(*index, domain),
            Expression::Load { address, size } => {
                let address = self.eval(address, domain);
                match domain.as_constant(&address) {
                    Some(address) => self.remove_overlapping(address, *size),
                    None => self.havoc_memory(),
                }
            }
            _ => {}
        }
    }

    pub fn apply_zone_action<D: ValueDomain<Value = V>>(&mut self, action: &ZoneAction, domain: &D) {
        match action {
            ZoneAction::Create {
                name,
                start,
                length,
            } => {
                let zone = Zone {
                    name: name.clone(),
                    start: self.eval(start, domain),
                    length: self.eval(length, domain),
                };
                self.zones.push(zone);
            }
            ZoneAction::Rename { from, to } => {
                if let Some(zone) = self.zones.iter_mut().find(|z| &z.name == from) {
                    zone.name = to.clone();
                }
            }
            ZoneAction::Split { zone, at, name } => {
                let at = self.eval(at, domain);
                let Some(index) = self.zones.iter().position(|z| &z.name == zone) else {
                    return;
                };
                let old = &self.zones[index];
                let end = domain.arithmetic(BinaryOp::Add, &old.start, &old.length);
                let kept = domain.arithmetic(BinaryOp::Sub, &at, &old.start);
                let given = domain.arithmetic(BinaryOp::Sub, &end, &at);
                self.zones[index].length = kept;
                self.zones.push(Zone {
                    name: name.clone(),
                    start: at,
                    length: given,
                });
            }
            ZoneAction::Merge { first, second } => {
                let Some(absorbed) = self.zones.iter().position(|z| &z.name == second) else {
                    return;
                };
                let absorbed = self.zones.remove(absorbed);
                if let Some(zone) = self.zones.iter_mut().find(|z| &z.name == first) {
                    let gap = domain.arithmetic(BinaryOp::Sub, &absorbed.start, &zone.start);
                    zone.length = domain.arithmetic(BinaryOp::Add, &gap, &absorbed.length);
                }
            }
        }
    }

    /// Narrow the state to the concrete states satisfying `property`.
    ///
    /// Returns false, and marks the state as bottom, when none does.
    pub fn assume<D: ValueDomain<Value = V>>(&mut self, property: &Property, domain: &D) -> bool {
        if self.bottom {
            return false;
        }
        let relation = normalized(property);
        let lhs = self.eval(&property.lhs, domain);
        let rhs = self.eval(&property.rhs, domain);

        let Some(refined) = domain.refine(relation, &lhs, &rhs) else {
            self.bottom = true;
            return false;
        };
        if property.lhs.is_location() {
            self.write_location(&property.lhs, refined.clone(), domain);
        }

        if property.rhs.is_location() {
            if let Some(flipped) = relation.flip() {
                match domain.refine(flipped, &rhs, &refined) {
                    Some(value) => self.write_location(&property.rhs, value, domain),
                    None => {
                        self.bottom = true;
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Apply a contract as a pre-condition: its zone actions run, the
    /// locations it constrains are forgotten, then each property is assumed.
    /// A location only read by a property, like `x0` in `x1 == x0`, keeps
    /// what the dominators said about it.
    pub fn assume_contract<D: ValueDomain<Value = V>>(&mut self, contract: &Contract, domain: &D) {
        for action in &contract.zone_actions {
            self.apply_zone_action(action, domain);
        }
        for property in &contract.properties {
            if let Some(location) = property.constrained_location() {
                self.havoc_location(location, domain);
            }
        }
        for property in &contract.properties {
            if !self.assume(property, domain) {
                break;
            }
        }
    }

    /// Decide `property` on this state. Any property holds on bottom.
    pub fn evaluate<D: ValueDomain<Value = V>>(&self, property: &Property, domain: &D) -> Truth {
        if self.bottom {
            return Truth::True;
        }
        domain.compare(
            normalized(property),
            &self.eval(&property.lhs, domain),
            &self.eval(&property.rhs, domain),
        )
    }

    /// Least state describing both `self` and `other`.
    pub fn join<D: ValueDomain<Value = V>>(&self, other: &Self, domain: &D) -> Self {
        if self.bottom {
            return other.clone();
        }
        if other.bottom {
            return self.clone();
        }
        let registers = self
            .registers
            .iter()
            .zip(&other.registers)
            .map(|(a, b)| domain.join(a, b))
            .collect();
        let memory = self
            .memory
            .iter()
            .filter_map(|(address, cell)| {
                let theirs = other.memory.get(address)?;
                (theirs.size == cell.size).then(|| {
                    (
                        *address,
                        MemoryCell {
                            size: cell.size,
                            value: domain.join(&cell.value, &theirs.value),
                        },
                    )
                })
            })
            .collect();
        let zones = self
            .zones
            .iter()
            .filter_map(|zone| {
                let theirs = other.zone(&zone.name)?;
                Some(Zone {
                    name: zone.name.clone(),
                    start: domain.join(&zone.start, &theirs.start),
                    length: domain.join(&zone.length, &theirs.length),
                })
            })
            .collect();
        Self {
            registers,
            memory,
            zones,
            bottom: false,
        }
    }
}

/// `x == [a, b]` reads as membership.
fn normalized(property: &Property) -> Relation {
    match (&property.relation, &property.rhs) {
        (Relation::Eq, Expression::Range { .. }) => Relation::In,
        (relation, _) => *relation,
    }
}

impl<V: fmt::Display> fmt::Display for AbstractState<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.bottom {
            return f.write_str("unreachable");
        }
        let registers = self
            .registers
            .iter()
            .enumerate()
            .map(|(index, value)| format!("#{}={}", index, value));
        let memory = self
            .memory
            .iter()
            .map(|(address, cell)| format!("[{:#x}]:{}={}", address, cell.size, cell.value));
        let zones = self
            .zones
            .iter()
            .map(|zone| format!("@{}={}+{}", zone.name, zone.start, zone.length));
        let parts: Vec<_> = registers.chain(memory).chain(zones).collect();
        f.write_str(&parts.join(", "))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::expression::parse_property;
    use crate::contract::expression::tests::TestRegisters;
    use crate::contract::expression::parse_expression;
    use crate::interval::{Interval, IntervalDomain};

    fn state() -> AbstractState<Interval> {
        AbstractState::new(9, &IntervalDomain)
    }

    fn property(text: &str) -> Property {
        parse_property(text, &TestRegisters).unwrap()
    }

    fn expression(text: &str) -> Expression {
        parse_expression(text, &TestRegisters).unwrap()
    }

    #[test]
    fn test_assume_then_evaluate() {
        let mut state = state();
        assert_eq!(state.evaluate(&property("r0 == 0"), &IntervalDomain), Truth::Unknown);

        assert!(state.assume(&property("r0 == 0"), &IntervalDomain));
        assert_eq!(state.evaluate(&property("r0 == 0"), &IntervalDomain), Truth::True);
        assert_eq!(state.evaluate(&property("r0 != 0"), &IntervalDomain), Truth::False);
    }

    #[test]
    fn test_assume_range_and_bounds() {
        let mut state = state();
        assert!(state.assume(&property("r1 in [4, 8]"), &IntervalDomain));
        assert!(state.assume(&property("r1 < 6"), &IntervalDomain));
        assert_eq!(state.register(1), Some(&Interval::new(4, 5).unwrap()));
        assert_eq!(state.evaluate(&property("r1 <= 5"), &IntervalDomain), Truth::True);
    }

    #[test]
    fn test_contradiction_is_bottom() {
        let mut state = state();
        assert!(state.assume(&property("r0 == 1"), &IntervalDomain));
        assert!(!state.assume(&property("r0 == 2"), &IntervalDomain));
        assert!(state.is_bottom());
        assert_eq!(state.evaluate(&property("r3 == 7"), &IntervalDomain), Truth::True);
    }

    #[test]
    fn test_assume_refines_right_hand_location() {
        let mut state = state();
        state.set_register(2, Interval::constant(10));
        assert!(state.assume(&property("r2 == r3"), &IntervalDomain));
        assert_eq!(state.register(3), Some(&Interval::constant(10)));
    }

    #[test]
    fn test_contract_keeps_locations_it_only_reads() {
        let graph = ContractGraph::from_source(
            r#"{"contracts": [
                {"id": 1, "address": 16, "nexts": [2], "constraints": ["r0 == 0", "r1 == 5"]},
                {"id": 2, "address": 32, "previouses": [1], "dominator": 1,
                 "constraints": ["r1 == r0"]}
            ]}"#,
            None,
            &TestRegisters,
        )
        .unwrap();
        let two = graph.by_id(2).unwrap();
        let state = AbstractState::for_contract(&graph, two, 9, &IntervalDomain);

        assert!(!state.is_bottom());
        assert_eq!(state.register(0), Some(&Interval::constant(0)));
        assert_eq!(state.register(1), Some(&Interval::constant(0)));
    }

    #[test]
    fn test_memory_constraints() {
        let mut state = state();
        state.set_register(8, Interval::constant(0x2000));
        assert!(state.assume(&property("[sp + 8]:4 == 3"), &IntervalDomain));
        assert_eq!(
            state.evaluate(&property("[sp + 8]:4 == 3"), &IntervalDomain),
            Truth::True
        );
        assert_eq!(
            state.evaluate(&property("[sp + 8]:1 == 3"), &IntervalDomain),
            Truth::True
        );

        // A store to an unknown address forgets memory
        state.store(&Interval::TOP, 8, Interval::constant(0), &IntervalDomain);
        assert_eq!(
            state.evaluate(&property("[sp + 8]:4 == 3"), &IntervalDomain),
            Truth::Unknown
        );
    }

    #[test]
    fn test_overlapping_store_replaces_cell() {
        let domain = IntervalDomain;
        let mut state = state();
        state.store(&Interval::constant(0x100), 8, Interval::constant(1), &domain);
        state.store(&Interval::constant(0x104), 4, Interval::constant(2), &domain);
        assert_eq!(state.memory().count(), 1);
        assert!(state
            .load(&Interval::constant(0x100), 8, &domain)
            .is_top());
    }

    #[test]
    fn test_weak_update() {
        let domain = IntervalDomain;
        let mut state = state();
        state.store(&Interval::constant(0x10), 1, Interval::constant(1), &domain);
        state.store(&Interval::constant(0x11), 1, Interval::constant(2), &domain);
        state.store(&Interval::new(0x10, 0x11).unwrap(), 1, Interval::constant(5), &domain);
        assert_eq!(
            state.load(&Interval::constant(0x10), 1, &domain),
            Interval::new(1, 5).unwrap()
        );
        assert_eq!(
            state.load(&Interval::constant(0x11), 1, &domain),
            Interval::new(2, 5).unwrap()
        );

        // Too many candidates: memory is forgotten
        state.store(&Interval::new(0, 0x100).unwrap(), 1, Interval::constant(0), &domain);
        assert_eq!(state.memory().count(), 0);
    }

    #[test]
    fn test_zone_actions() {
        let domain = IntervalDomain;
        let mut state = state();
        let create = ZoneAction::Create {
            name: "stack".into(),
            start: expression("0x1000"),
            length: expression("0x100"),
        };
        state.apply_zone_action(&create, &domain);

        let split = ZoneAction::Split {
            zone: "stack".into(),
            at: expression("@stack + 0x40"),
            name: "locals".into(),
        };
        state.apply_zone_action(&split, &domain);
        let stack = state.zone("stack").unwrap();
        assert_eq!(stack.length, Interval::constant(0x40));
        let locals = state.zone("locals").unwrap();
        assert_eq!(locals.start, Interval::constant(0x1040));
        assert_eq!(locals.length, Interval::constant(0xc0));

        let merge = ZoneAction::Merge {
            first: "stack".into(),
            second: "locals".into(),
        };
        state.apply_zone_action(&merge, &domain);
        assert!(state.zone("locals").is_none());
        assert_eq!(state.zone("stack").unwrap().length, Interval::constant(0x100));

        state.apply_zone_action(
            &ZoneAction::Rename {
                from: "stack".into(),
                to: "frame".into(),
            },
            &domain,
        );
        assert_eq!(
            state.eval(&expression("@frame + 4"), &domain),
            Interval::constant(0x1004)
        );
    }

    #[test]
    fn test_join() {
        let domain = IntervalDomain;
        let mut a = state();
        let mut b = state();
        a.set_register(0, Interval::constant(1));
        b.set_register(0, Interval::constant(3));
        a.store(&Interval::constant(0x40), 8, Interval::constant(0), &domain);

        let joined = a.join(&b, &domain);
        assert_eq!(joined.register(0), Some(&Interval::new(1, 3).unwrap()));
        assert_eq!(joined.memory().count(), 0);

        let mut dead = state();
        dead.set_bottom();
        assert_eq!(dead.join(&a, &domain), a);
    }
}
