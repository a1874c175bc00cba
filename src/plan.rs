//! Read plans: which antennas, protocol, filter and embedded operation a
//! read cycle uses.
//!
//! Construction is pure. Checks that depend on the reader (connected ports,
//! supported protocols) run in [`ReadPlan::validate`] when the plan is
//! committed.

use crate::caps::Capabilities;
use crate::error::{ReaderError, Result};
use crate::filter::TagFilter;
use crate::tagop::TagOp;
use crate::types::TagProtocol;

/// Sub-plan cap used by [`MultiReadPlan::new`]
pub const DEFAULT_MAX_SUBPLANS: usize = 5;

/// Sub-plan counts travel in one byte, so no cap can go above this
pub const MAX_SUBPLANS: usize = u8::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimpleReadPlan {
    antennas: Vec<u8>,
    protocol: TagProtocol,
    weight: u32,
    filter: Option<TagFilter>,
    tag_op: Option<TagOp>,
    stop_on_count: Option<u32>,
}

impl SimpleReadPlan {
    /// `weight` is the plan's share of a read cycle, in milliseconds when used alone.
    pub fn new(antennas: &[u8], protocol: TagProtocol, weight: u32) -> Result<Self> {
        if antennas.is_empty() {
            return Err(ReaderError::InvalidAntenna("Antenna list is empty".into()));
        }
        if let Some(port) = antennas.iter().find(|&&p| p == 0) {
            return Err(ReaderError::InvalidAntenna(format!("Antenna port {} does not exist", port)));
        }
        let mut ports = Vec::with_capacity(antennas.len());
        for &port in antennas {
            if !ports.contains(&port) {
                ports.push(port);
            }
        }
        Ok(Self {
            antennas: ports,
            protocol,
            weight,
            filter: None,
            tag_op: None,
            stop_on_count: None,
        })
    }

    pub fn antennas(&self) -> &[u8] {
        &self.antennas
    }

    pub fn protocol(&self) -> TagProtocol {
        self.protocol
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn filter(&self) -> Option<&TagFilter> {
        self.filter.as_ref()
    }

    pub fn tag_op(&self) -> Option<&TagOp> {
        self.tag_op.as_ref()
    }

    pub fn stop_on_count(&self) -> Option<u32> {
        self.stop_on_count
    }

    /// Attach or replace the filter. `None` removes it.
    pub fn set_filter(&mut self, filter: Option<TagFilter>) {
        self.filter = filter;
    }

    /// Attach or replace the embedded tag operation. `None` removes it.
    pub fn set_tag_op(&mut self, tag_op: Option<TagOp>) {
        self.tag_op = tag_op;
    }

    /// End the cycle once this many distinct tags were seen
    pub fn set_stop_on_count(&mut self, count: Option<u32>) {
        self.stop_on_count = count;
    }

    pub fn with_filter(mut self, filter: TagFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_tag_op(mut self, tag_op: TagOp) -> Self {
        self.tag_op = Some(tag_op);
        self
    }

    pub fn with_stop_on_count(mut self, count: u32) -> Self {
        self.stop_on_count = Some(count);
        self
    }

    fn validate(&self, caps: &Capabilities) -> Result<()> {
        for &port in &self.antennas {
            if !caps.is_port(port) {
                return Err(ReaderError::InvalidAntenna(format!(
                    "Antenna {} does not exist (ports: {:?})",
                    port, caps.ports
                )));
            }
            if !caps.is_connected_port(port) {
                return Err(ReaderError::InvalidAntenna(format!(
                    "Antenna {} is not connected (connected: {:?})",
                    port, caps.connected_ports
                )));
            }
        }
        if !caps.supports_protocol(self.protocol) {
            return Err(ReaderError::InvalidValue(format!(
                "Protocol {:?} is not supported by the reader",
                self.protocol
            )));
        }
        if let Some(filter) = &self.filter {
            if filter.protocol() != self.protocol {
                return Err(ReaderError::InvalidFilter(format!(
                    "Filter is for {:?} but the plan reads {:?}",
                    filter.protocol(),
                    self.protocol
                )));
            }
        }
        if let Some(op) = &self.tag_op {
            if op.protocol() != self.protocol {
                return Err(ReaderError::TagOpUnsupported(format!(
                    "{} cannot be embedded in a {:?} plan",
                    op.name(),
                    self.protocol
                )));
            }
            op.validate()?;
        }
        if self.stop_on_count == Some(0) {
            return Err(ReaderError::InvalidValue("Stop trigger count must be at least 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiReadPlan {
    plans: Vec<ReadPlan>,
    weight: u32,
}

impl MultiReadPlan {
    /// Combine sub-plans; at most [`DEFAULT_MAX_SUBPLANS`] of them.
    pub fn new(plans: Vec<ReadPlan>, total_weight: u32) -> Result<Self> {
        Self::with_limit(plans, total_weight, DEFAULT_MAX_SUBPLANS)
    }

    /// Combine sub-plans under a caller-chosen cap, itself capped at
    /// [`MAX_SUBPLANS`]. A zero `total_weight` means the sum of the sub-plan
    /// weights.
    pub fn with_limit(plans: Vec<ReadPlan>, total_weight: u32, limit: usize) -> Result<Self> {
        let limit = limit.min(MAX_SUBPLANS);
        if plans.is_empty() {
            return Err(ReaderError::InvalidValue("Multi read plan needs at least one sub-plan".into()));
        }
        if plans.len() > limit {
            return Err(ReaderError::TooManySubplans {
                count: plans.len(),
                limit,
            });
        }
        let weight = if total_weight == 0 {
            plans.iter().map(ReadPlan::weight).fold(0u32, u32::saturating_add)
        } else {
            total_weight
        };
        Ok(Self { plans, weight })
    }

    pub fn plans(&self) -> &[ReadPlan] {
        &self.plans
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }
}

/// Declarative description of a read cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadPlan {
    Simple(SimpleReadPlan),
    Multi(MultiReadPlan),
}

impl ReadPlan {
    pub fn simple(antennas: &[u8], protocol: TagProtocol, weight: u32) -> Result<Self> {
        Ok(Self::Simple(SimpleReadPlan::new(antennas, protocol, weight)?))
    }

    pub fn multi(plans: Vec<ReadPlan>, total_weight: u32) -> Result<Self> {
        Ok(Self::Multi(MultiReadPlan::new(plans, total_weight)?))
    }

    pub fn weight(&self) -> u32 {
        match self {
            Self::Simple(plan) => plan.weight,
            Self::Multi(plan) => plan.weight,
        }
    }

    /// Check the plan against the reader. `max_subplans` bounds every
    /// multi plan in the tree.
    pub fn validate(&self, caps: &Capabilities, max_subplans: usize) -> Result<()> {
        let max_subplans = max_subplans.min(MAX_SUBPLANS);
        match self {
            Self::Simple(plan) => plan.validate(caps),
            Self::Multi(plan) => {
                if plan.plans.len() > max_subplans {
                    return Err(ReaderError::TooManySubplans {
                        count: plan.plans.len(),
                        limit: max_subplans,
                    });
                }
                plan.plans.iter().try_for_each(|sub| sub.validate(caps, max_subplans))
            }
        }
    }

    /// Leaf plans in order, each with its share of `duration_ms`
    pub fn schedule(&self, duration_ms: u32) -> Vec<(&SimpleReadPlan, u32)> {
        let mut out = Vec::new();
        self.collect_schedule(duration_ms, &mut out);
        out
    }

    fn collect_schedule<'a>(&'a self, duration_ms: u32, out: &mut Vec<(&'a SimpleReadPlan, u32)>) {
        match self {
            Self::Simple(plan) => out.push((plan, duration_ms)),
            Self::Multi(plan) => {
                let total = plan.plans.iter().map(ReadPlan::weight).map(u64::from).sum::<u64>();
                for sub in &plan.plans {
                    let share = if total == 0 {
                        duration_ms as u64 / plan.plans.len() as u64
                    } else {
                        duration_ms as u64 * sub.weight() as u64 / total
                    };
                    sub.collect_schedule(share as u32, out);
                }
            }
        }
    }

    /// True when any embedded operation will ask for a password mid-read
    pub fn needs_auth_request(&self) -> bool {
        self.schedule(0)
            .iter()
            .any(|(plan, _)| plan.tag_op().is_some_and(TagOp::needs_auth_request))
    }
}

impl From<SimpleReadPlan> for ReadPlan {
    fn from(plan: SimpleReadPlan) -> Self {
        Self::Simple(plan)
    }
}

impl From<MultiReadPlan> for ReadPlan {
    fn from(plan: MultiReadPlan) -> Self {
        Self::Multi(plan)
    }
}
