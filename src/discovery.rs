//! Types describing cast receivers found on the local network.
//!
//! Discovery itself (multicast DNS) is a collaborator concern; this module
//! only defines the tuple it delivers and the decoding of the capability
//! bitmap (`ca` TXT record) devices advertise.

/// One capability bit from the `ca` bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Capability {
    VideoOut = 1,
    VideoIn = 2,
    AudioOut = 4,
    AudioIn = 8,
    DevMode = 16,
    MultizoneGroup = 32,
    DynamicGroup = 64,
    MultiChannelGroup = 128,
    MultiChannelMember = 256,
    MasterOrFixedVolume = 2048,
    AttenuationOrFixedVolume = 4096,
    DynamicGroupingSupported = 65536,
}

impl Capability {
    const ALL: [Capability; 12] = [
        Capability::VideoOut,
        Capability::VideoIn,
        Capability::AudioOut,
        Capability::AudioIn,
        Capability::DevMode,
        Capability::MultizoneGroup,
        Capability::DynamicGroup,
        Capability::MultiChannelGroup,
        Capability::MultiChannelMember,
        Capability::MasterOrFixedVolume,
        Capability::AttenuationOrFixedVolume,
        Capability::DynamicGroupingSupported,
    ];

    /// Decodes a raw bitmap into the known capability bits; unknown bits are
    /// ignored.
    pub fn decode(bitmap: u32) -> Vec<Capability> {
        Capability::ALL
            .iter()
            .copied()
            .filter(|capability| bitmap & (*capability as u32) != 0)
            .collect()
    }
}

/// A cast receiver as delivered by a discovery collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    /// Human-readable device name ("Living Room TV").
    pub display_name: String,
    /// Resolved address the channel connects to.
    pub host: String,
    pub port: u16,
    /// Stable device identifier (`id` TXT record).
    pub unique_id: String,
    /// Raw capability bitmap (`ca` TXT record).
    pub capabilities: u32,
}

impl DiscoveredDevice {
    pub fn capabilities(&self) -> Vec<Capability> {
        Capability::decode(self.capabilities)
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities & (capability as u32) != 0
    }
}
