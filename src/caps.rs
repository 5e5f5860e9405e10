//! Capability descriptor parsing and validation.
//!
//! Interface providers declare what they support in a binary capability
//! blob: the packet-hook points they expose and the protocol versions they
//! can speak. The blob is untrusted input and is fully validated here, with
//! checked offset arithmetic, before anything else looks at it.
//!
//! Blob layout (all integer fields little-endian `u32` unless noted):
//!
//! ```text
//! 0   revision
//! 4   size                  declared total size of the blob
//! 8   mode                  0 = generic, 1 = native
//! 12  instance_id           u64, provider-chosen channel instance
//! 20  hook_array_offset     start of hook records
//! 24  hook_count
//! 28  version_array_offset  start of version records
//! 32  version_count
//! ```
//!
//! Hook records are `(layer, direction, sublayer)` u32 triples; version
//! records are `(major, minor, patch)` u32 triples.

use std::fmt;

use crate::error::BindError;

/// First (and currently only) revision of the capability blob layout.
pub const CAPABILITIES_REVISION_1: u32 = 1;

/// Fixed header size preceding the hook and version arrays.
pub const CAPABILITIES_MIN_SIZE: u32 = 36;

const HOOK_RECORD_SIZE: u32 = 12;
const VERSION_RECORD_SIZE: u32 = 12;

/// Latest protocol version this module speaks with providers.
pub const DRIVER_API_CURRENT: ApiVersion = ApiVersion::new(1, 2, 0);

/// Packet-processing layer of a hook point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookLayer {
    L2,
}

/// Traffic direction of a hook point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookDirection {
    Rx,
    Tx,
}

/// Position within the layer: observe-only or inject-capable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookSublayer {
    Inspect,
    Inject,
}

/// Identifies one packet-processing point an interface exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId {
    pub layer: HookLayer,
    pub direction: HookDirection,
    pub sublayer: HookSublayer,
}

impl HookId {
    pub const fn new(layer: HookLayer, direction: HookDirection, sublayer: HookSublayer) -> Self {
        Self {
            layer,
            direction,
            sublayer,
        }
    }
}

/// `(major, minor, patch)` protocol version triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ApiVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Whether `self` (the module's current version) can serve a provider
    /// whose minimum supported version is `candidate`: same major, and
    /// minor/patch each at least the candidate's.
    pub(crate) fn accepts(&self, candidate: &ApiVersion) -> bool {
        self.major == candidate.major
            && self.minor >= candidate.minor
            && self.patch >= candidate.patch
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Attachment mode of a binding. An interface may expose one binding per
/// mode: a generic (software fallback) one and a native (driver-accelerated)
/// one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterfaceMode {
    Generic,
    Native,
}

/// Number of mode slots an interface set carries.
pub(crate) const MODE_COUNT: usize = 2;

impl InterfaceMode {
    pub(crate) fn slot(self) -> usize {
        match self {
            InterfaceMode::Generic => 0,
            InterfaceMode::Native => 1,
        }
    }

    fn from_wire(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(InterfaceMode::Generic),
            1 => Some(InterfaceMode::Native),
            _ => None,
        }
    }

    fn to_wire(self) -> u32 {
        self.slot() as u32
    }
}

impl fmt::Display for InterfaceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterfaceMode::Generic => write!(f, "generic"),
            InterfaceMode::Native => write!(f, "native"),
        }
    }
}

/// Parsed, validated capability descriptor. Immutable once built; the
/// binding trusts this for its whole lifetime.
#[derive(Debug, Clone)]
pub struct CapabilitySet {
    mode: InterfaceMode,
    instance_id: u64,
    hooks: Vec<HookId>,
    versions: Vec<ApiVersion>,
}

impl CapabilitySet {
    /// Validate and parse a provider-supplied capability blob.
    ///
    /// Any structural violation (short header, declared size beyond the
    /// buffer, array bounds overflowing 32 bits or exceeding the declared
    /// size, unknown discriminants) yields [`BindError::InvalidCapability`]
    /// before any other effect.
    pub fn parse(blob: &[u8]) -> Result<Self, BindError> {
        if blob.len() < CAPABILITIES_MIN_SIZE as usize {
            return Err(BindError::InvalidCapability("blob shorter than header"));
        }

        let revision = read_u32(blob, 0);
        let declared_size = read_u32(blob, 4);
        if revision < CAPABILITIES_REVISION_1 || declared_size < CAPABILITIES_MIN_SIZE {
            return Err(BindError::InvalidCapability("unsupported header revision"));
        }
        if declared_size as usize > blob.len() {
            return Err(BindError::InvalidCapability("declared size beyond buffer"));
        }

        let mode = InterfaceMode::from_wire(read_u32(blob, 8))
            .ok_or(BindError::InvalidCapability("unknown interface mode"))?;
        let instance_id = read_u64(blob, 12);

        let hook_offset = read_u32(blob, 20);
        let hook_count = read_u32(blob, 24);
        let version_offset = read_u32(blob, 28);
        let version_count = read_u32(blob, 32);

        check_array(hook_offset, hook_count, HOOK_RECORD_SIZE, declared_size)
            .ok_or(BindError::InvalidCapability("hook array out of bounds"))?;
        check_array(version_offset, version_count, VERSION_RECORD_SIZE, declared_size)
            .ok_or(BindError::InvalidCapability("version array out of bounds"))?;

        let mut hooks = Vec::with_capacity(hook_count as usize);
        for index in 0..hook_count {
            let base = (hook_offset + index * HOOK_RECORD_SIZE) as usize;
            hooks.push(parse_hook(blob, base)?);
        }

        let mut versions = Vec::with_capacity(version_count as usize);
        for index in 0..version_count {
            let base = (version_offset + index * VERSION_RECORD_SIZE) as usize;
            versions.push(ApiVersion::new(
                read_u32(blob, base),
                read_u32(blob, base + 4),
                read_u32(blob, base + 8),
            ));
        }

        Ok(Self {
            mode,
            instance_id,
            hooks,
            versions,
        })
    }

    pub fn mode(&self) -> InterfaceMode {
        self.mode
    }

    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    pub fn hooks(&self) -> &[HookId] {
        &self.hooks
    }

    /// Minimum supported versions in the order the provider advertised them.
    pub fn versions(&self) -> &[ApiVersion] {
        &self.versions
    }

    /// Whether this interface exposes the given hook point.
    pub fn supports_hook(&self, target: &HookId) -> bool {
        self.hooks.iter().any(|candidate| candidate == target)
    }

    /// Whether this interface exposes every one of the given hook points.
    pub fn supports_hooks(&self, targets: &[HookId]) -> bool {
        targets.iter().all(|target| self.supports_hook(target))
    }
}

fn parse_hook(blob: &[u8], base: usize) -> Result<HookId, BindError> {
    let layer = match read_u32(blob, base) {
        0 => HookLayer::L2,
        _ => return Err(BindError::InvalidCapability("unknown hook layer")),
    };
    let direction = match read_u32(blob, base + 4) {
        0 => HookDirection::Rx,
        1 => HookDirection::Tx,
        _ => return Err(BindError::InvalidCapability("unknown hook direction")),
    };
    let sublayer = match read_u32(blob, base + 8) {
        0 => HookSublayer::Inspect,
        1 => HookSublayer::Inject,
        _ => return Err(BindError::InvalidCapability("unknown hook sublayer")),
    };
    Ok(HookId::new(layer, direction, sublayer))
}

/// `offset + count * elem` with checked 32-bit arithmetic; `Some(())` when
/// the array lies fully within the declared size.
fn check_array(offset: u32, count: u32, elem: u32, declared_size: u32) -> Option<()> {
    let span = count.checked_mul(elem)?;
    let end = offset.checked_add(span)?;
    if end <= declared_size {
        Some(())
    } else {
        None
    }
}

fn read_u32(blob: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(blob[offset..offset + 4].try_into().unwrap())
}

fn read_u64(blob: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(blob[offset..offset + 8].try_into().unwrap())
}

/// Builder producing a wire-format capability blob. Interface providers use
/// this to declare their hook points and supported protocol versions.
#[derive(Debug, Clone)]
pub struct CapabilityBlobBuilder {
    mode: InterfaceMode,
    instance_id: u64,
    hooks: Vec<HookId>,
    versions: Vec<ApiVersion>,
}

impl CapabilityBlobBuilder {
    pub fn new(mode: InterfaceMode, instance_id: u64) -> Self {
        Self {
            mode,
            instance_id,
            hooks: Vec::new(),
            versions: Vec::new(),
        }
    }

    pub fn hook(mut self, hook: HookId) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn version(mut self, version: ApiVersion) -> Self {
        self.versions.push(version);
        self
    }

    pub fn build(self) -> Vec<u8> {
        let hook_offset = CAPABILITIES_MIN_SIZE;
        let version_offset = hook_offset + self.hooks.len() as u32 * HOOK_RECORD_SIZE;
        let total = version_offset + self.versions.len() as u32 * VERSION_RECORD_SIZE;

        let mut blob = Vec::with_capacity(total as usize);
        blob.extend_from_slice(&CAPABILITIES_REVISION_1.to_le_bytes());
        blob.extend_from_slice(&total.to_le_bytes());
        blob.extend_from_slice(&self.mode.to_wire().to_le_bytes());
        blob.extend_from_slice(&self.instance_id.to_le_bytes());
        blob.extend_from_slice(&hook_offset.to_le_bytes());
        blob.extend_from_slice(&(self.hooks.len() as u32).to_le_bytes());
        blob.extend_from_slice(&version_offset.to_le_bytes());
        blob.extend_from_slice(&(self.versions.len() as u32).to_le_bytes());

        for hook in &self.hooks {
            let layer = match hook.layer {
                HookLayer::L2 => 0u32,
            };
            let direction = match hook.direction {
                HookDirection::Rx => 0u32,
                HookDirection::Tx => 1u32,
            };
            let sublayer = match hook.sublayer {
                HookSublayer::Inspect => 0u32,
                HookSublayer::Inject => 1u32,
            };
            blob.extend_from_slice(&layer.to_le_bytes());
            blob.extend_from_slice(&direction.to_le_bytes());
            blob.extend_from_slice(&sublayer.to_le_bytes());
        }
        for version in &self.versions {
            blob.extend_from_slice(&version.major.to_le_bytes());
            blob.extend_from_slice(&version.minor.to_le_bytes());
            blob.extend_from_slice(&version.patch.to_le_bytes());
        }

        blob
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const L2_RX_INSPECT: HookId =
        HookId::new(HookLayer::L2, HookDirection::Rx, HookSublayer::Inspect);
    const L2_TX_INJECT: HookId =
        HookId::new(HookLayer::L2, HookDirection::Tx, HookSublayer::Inject);

    fn sample_blob() -> Vec<u8> {
        CapabilityBlobBuilder::new(InterfaceMode::Generic, 0x1122_3344_5566_7788)
            .hook(L2_RX_INSPECT)
            .hook(L2_TX_INJECT)
            .version(ApiVersion::new(1, 0, 0))
            .version(ApiVersion::new(1, 2, 0))
            .build()
    }

    #[test]
    fn parse_round_trips_builder_output() {
        let caps = CapabilitySet::parse(&sample_blob()).unwrap();
        assert_eq!(caps.mode(), InterfaceMode::Generic);
        assert_eq!(caps.instance_id(), 0x1122_3344_5566_7788);
        assert_eq!(caps.hooks(), &[L2_RX_INSPECT, L2_TX_INJECT]);
        assert_eq!(
            caps.versions(),
            &[ApiVersion::new(1, 0, 0), ApiVersion::new(1, 2, 0)]
        );
    }

    #[test]
    fn rejects_short_blob() {
        let blob = sample_blob();
        assert_eq!(
            CapabilitySet::parse(&blob[..CAPABILITIES_MIN_SIZE as usize - 1]).unwrap_err(),
            BindError::InvalidCapability("blob shorter than header")
        );
    }

    #[test]
    fn rejects_zero_revision() {
        let mut blob = sample_blob();
        blob[0..4].copy_from_slice(&0u32.to_le_bytes());
        assert!(matches!(
            CapabilitySet::parse(&blob),
            Err(BindError::InvalidCapability(_))
        ));
    }

    #[test]
    fn rejects_declared_size_beyond_buffer() {
        let mut blob = sample_blob();
        let inflated = blob.len() as u32 + 1;
        blob[4..8].copy_from_slice(&inflated.to_le_bytes());
        assert!(matches!(
            CapabilitySet::parse(&blob),
            Err(BindError::InvalidCapability("declared size beyond buffer"))
        ));
    }

    #[test]
    fn rejects_hook_array_exceeding_declared_size() {
        let mut blob = sample_blob();
        // Declared size stops before the end of the hook array.
        blob[24..28].copy_from_slice(&1000u32.to_le_bytes());
        assert!(matches!(
            CapabilitySet::parse(&blob),
            Err(BindError::InvalidCapability("hook array out of bounds"))
        ));
    }

    #[test]
    fn rejects_hook_count_overflow() {
        let mut blob = sample_blob();
        blob[24..28].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            CapabilitySet::parse(&blob),
            Err(BindError::InvalidCapability("hook array out of bounds"))
        ));
    }

    #[test]
    fn rejects_version_offset_overflow() {
        let mut blob = sample_blob();
        blob[28..32].copy_from_slice(&u32::MAX.to_le_bytes());
        blob[32..36].copy_from_slice(&1u32.to_le_bytes());
        assert!(matches!(
            CapabilitySet::parse(&blob),
            Err(BindError::InvalidCapability("version array out of bounds"))
        ));
    }

    #[test]
    fn rejects_unknown_mode() {
        let mut blob = sample_blob();
        blob[8..12].copy_from_slice(&7u32.to_le_bytes());
        assert!(matches!(
            CapabilitySet::parse(&blob),
            Err(BindError::InvalidCapability("unknown interface mode"))
        ));
    }

    #[test]
    fn rejects_unknown_hook_discriminant() {
        let mut blob = sample_blob();
        let hook_base = CAPABILITIES_MIN_SIZE as usize;
        blob[hook_base + 4..hook_base + 8].copy_from_slice(&9u32.to_le_bytes());
        assert!(matches!(
            CapabilitySet::parse(&blob),
            Err(BindError::InvalidCapability("unknown hook direction"))
        ));
    }

    #[test]
    fn supports_hook_matches_all_three_components() {
        let caps = CapabilitySet::parse(&sample_blob()).unwrap();
        assert!(caps.supports_hook(&L2_RX_INSPECT));
        assert!(!caps.supports_hook(&HookId::new(
            HookLayer::L2,
            HookDirection::Rx,
            HookSublayer::Inject
        )));
        assert!(caps.supports_hooks(&[L2_RX_INSPECT, L2_TX_INJECT]));
        assert!(!caps.supports_hooks(&[
            L2_RX_INSPECT,
            HookId::new(HookLayer::L2, HookDirection::Tx, HookSublayer::Inspect)
        ]));
        assert!(caps.supports_hooks(&[]));
    }

    #[test]
    fn version_acceptance_requires_same_major_and_ge_minor_patch() {
        let current = ApiVersion::new(1, 2, 0);
        assert!(current.accepts(&ApiVersion::new(1, 0, 0)));
        assert!(current.accepts(&ApiVersion::new(1, 2, 0)));
        assert!(!current.accepts(&ApiVersion::new(1, 3, 0)));
        assert!(!current.accepts(&ApiVersion::new(2, 0, 0)));
        assert!(!current.accepts(&ApiVersion::new(0, 1, 0)));
        assert!(!current.accepts(&ApiVersion::new(1, 2, 1)));
    }
}
