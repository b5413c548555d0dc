use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use crate::error::{Result, VmiopError};


/// Opaque reference to an environment-owned object.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(u32);


impl Handle {
    /// Never refers to an object.
    pub const NULL: Handle = Handle(0);

    pub const fn from_raw(raw: u32) -> Self { Handle(raw) }
    pub const fn raw(self) -> u32 { self.0 }
    pub const fn is_null(self) -> bool { self.0 == 0 }
}


impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}


/// Role of a plugin; governs message routing on the bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum PluginClass {
    /// No external function.
    Null = 0,
    /// Graphics device emulation.
    Display = 1,
    /// Display presentation.
    Presentation = 9,
}


impl PluginClass {
    pub const fn raw(self) -> u32 { self as u32 }

    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(PluginClass::Null),
            1 => Some(PluginClass::Display),
            9 => Some(PluginClass::Presentation),
            _ => None,
        }
    }
}


/// Set of plugin classes, one bit per class value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassSet(u32);


impl ClassSet {
    pub const EMPTY: ClassSet = ClassSet(0);

    pub const fn from_bits(bits: u32) -> Self { ClassSet(bits) }
    pub const fn bits(self) -> u32 { self.0 }

    pub const fn of(class: PluginClass) -> Self { ClassSet(1 << class.raw()) }

    pub const fn with(self, class: PluginClass) -> Self { ClassSet(self.0 | (1 << class.raw())) }

    pub const fn contains(self, class: PluginClass) -> bool { self.0 & (1 << class.raw()) != 0 }

    pub const fn is_empty(self) -> bool { self.0 == 0 }
}


impl FromIterator<PluginClass> for ClassSet {
    fn from_iter<I: IntoIterator<Item = PluginClass>>(iter: I) -> Self {
        iter.into_iter().fold(ClassSet::EMPTY, ClassSet::with)
    }
}


/// Bus direction relative to the caller's position in the stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum Direction {
    /// Toward devices.
    Down = 0,
    /// Toward the virtual machine.
    Up = 1,
}


/// Position of a device in the live-migration lifecycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum MigrationStage {
    /// Normal running state.
    #[default]
    None = 0,
    /// Pre-copy, vCPUs running.
    PreCopy = 1,
    /// Stopped, vCPUs paused.
    StopAndCopy = 2,
    /// Starting on the destination, vCPUs paused.
    Resume = 3,
}


impl MigrationStage {
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(MigrationStage::None),
            1 => Some(MigrationStage::PreCopy),
            2 => Some(MigrationStage::StopAndCopy),
            3 => Some(MigrationStage::Resume),
            _ => None,
        }
    }

    /// Whether `next` may follow `self`.
    ///
    /// Forward edges: none → pre_copy → stop_and_copy → resume → none, plus
    /// none → stop_and_copy for a migration without a pre-copy pass.
    ///
    /// pre_copy → none and stop_and_copy → none are the abort path: the
    /// hypervisor cancels the episode and any partially streamed state is
    /// dropped. Once in resume the episode can only finish.
    pub const fn can_advance_to(self, next: MigrationStage) -> bool {
        use MigrationStage::*;
        matches!(
            (self, next),
            (None, PreCopy)
                | (None, StopAndCopy)
                | (PreCopy, StopAndCopy)
                | (StopAndCopy, Resume)
                | (Resume, None)
                | (PreCopy, None)
                | (StopAndCopy, None)
        )
    }

    /// Device state may be streamed in this stage.
    pub const fn is_streaming(self) -> bool { !matches!(self, MigrationStage::None) }
}


/// Plugin log severity. `Fatal` never returns to the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum LogLevel {
    Fatal = 0,
    Error = 1,
    Notice = 2,
    Status = 3,
    Debug = 4,
}


#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuestIdType {
    /// 4 byte domain ID.
    #[default]
    DomainId,
    /// 16 byte UUID.
    Uuid,
}


#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuestId {
    Domain(u32),
    Uuid(uuid::Uuid),
}


/// Guest access mode of a mapped region.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    None,
    #[default]
    ReadWrite,
    ReadOnly,
}


/// Nanoseconds from an undefined, process-wide base.
pub type VmiopTime = u64;


static TIME_BASE: OnceLock<Instant> = OnceLock::new();


fn time_base() -> Instant {
    *TIME_BASE.get_or_init(Instant::now)
}


/// Current time on the clock deadlines are expressed in.
pub fn now() -> VmiopTime {
    time_base().elapsed().as_nanos().min(u128::from(u64::MAX - 1)) as u64
}


/// Absolute limit for a blocking wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Deadline(VmiopTime);


impl Deadline {
    /// Wait indefinitely.
    pub const NO_LIMIT: Deadline = Deadline(u64::MAX);

    /// Already expired: turns any wait into a poll.
    pub const POLL: Deadline = Deadline(0);

    pub const fn at(time: VmiopTime) -> Self { Deadline(time) }

    pub fn after(timeout: Duration) -> Self {
        let nanos = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX - 1);
        Deadline(now().saturating_add(nanos).min(u64::MAX - 1))
    }

    pub const fn time(self) -> VmiopTime { self.0 }

    pub const fn is_unlimited(self) -> bool { self.0 == u64::MAX }

    /// Monotonic instant for this deadline, `None` when unlimited.
    pub fn instant(self) -> Option<Instant> {
        if self.is_unlimited() {
            return None;
        }
        Some(time_base() + Duration::from_nanos(self.0))
    }

    pub fn has_passed(self) -> bool { !self.is_unlimited() && now() >= self.0 }
}


#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    UnsignedInteger,
    Integer,
    String,
    Reference,
}


/// Value of a plugin attribute.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Unsigned(u64),
    Integer(i64),
    String(String),
    Reference(Handle),
}


impl AttributeValue {
    pub fn kind(&self) -> AttributeType {
        match self {
            AttributeValue::Unsigned(_) => AttributeType::UnsignedInteger,
            AttributeValue::Integer(_) => AttributeType::Integer,
            AttributeValue::String(_) => AttributeType::String,
            AttributeValue::Reference(_) => AttributeType::Reference,
        }
    }

    /// Converts to another attribute type.
    ///
    /// Fails with `Range` when a number does not fit the target and with
    /// `Inval` when a string does not parse or a reference is involved.
    pub fn convert(&self, target: AttributeType) -> Result<AttributeValue> {
        if self.kind() == target {
            return Ok(self.clone());
        }
        match (self, target) {
            (AttributeValue::Unsigned(v), AttributeType::Integer) => {
                i64::try_from(*v).map(AttributeValue::Integer).map_err(|_| VmiopError::Range)
            }
            (AttributeValue::Integer(v), AttributeType::UnsignedInteger) => {
                u64::try_from(*v).map(AttributeValue::Unsigned).map_err(|_| VmiopError::Range)
            }
            (AttributeValue::Unsigned(v), AttributeType::String) => Ok(AttributeValue::String(v.to_string())),
            (AttributeValue::Integer(v), AttributeType::String) => Ok(AttributeValue::String(v.to_string())),
            (AttributeValue::String(s), AttributeType::UnsignedInteger) => {
                parse_unsigned(s.trim()).map(AttributeValue::Unsigned)
            }
            (AttributeValue::String(s), AttributeType::Integer) => {
                s.trim().parse::<i64>().map(AttributeValue::Integer).map_err(|_| VmiopError::Inval)
            }
            _ => Err(VmiopError::Inval),
        }
    }

    pub fn as_unsigned(&self) -> Option<u64> {
        match self.convert(AttributeType::UnsignedInteger) {
            Ok(AttributeValue::Unsigned(v)) => Some(v),
            _ => None,
        }
    }
}


fn parse_unsigned(s: &str) -> Result<u64> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse::<u64>(),
    };
    parsed.map_err(|_| VmiopError::Inval)
}


/// Capability bits reported through [`ATTRIBUTE_VGPU_CAP`].
pub const ATTRIBUTE_VGPU_CAP: &str = "vmiop_vgpu_cap";
pub const VGPU_CAP_MIGRATION: u64 = 1 << 0;


/// Set by the environment when the hypervisor can migrate devices.
pub const ATTRIBUTE_VMM_MIGRATION_SUPPORTED: &str = "vmiop_vmm_migration_supported";
