//! Joint identifiers and the segment table

use serde::{Deserialize, Serialize};

/// A named skeletal joint
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum Bone {
    Root,
    Pelvis,
    LThigh1,
    LThigh2,
    LCalf,
    LFoot,
    RThigh1,
    RThigh2,
    RCalf,
    RFoot,
    Spine1,
    Spine2,
    Spine3,
    LCollarbone,
    LUpperarm,
    LForearm1,
    LForearm2,
    LPalm,
    RCollarbone,
    RUpperarm,
    RForearm1,
    RForearm2,
    RPalm,
    Neck,
    Head,
}

impl Bone {
    /// Number of joints
    pub const COUNT: usize = 25;

    /// Every joint, in index order
    pub const ALL: [Bone; Bone::COUNT] = [
        Bone::Root,
        Bone::Pelvis,
        Bone::LThigh1,
        Bone::LThigh2,
        Bone::LCalf,
        Bone::LFoot,
        Bone::RThigh1,
        Bone::RThigh2,
        Bone::RCalf,
        Bone::RFoot,
        Bone::Spine1,
        Bone::Spine2,
        Bone::Spine3,
        Bone::LCollarbone,
        Bone::LUpperarm,
        Bone::LForearm1,
        Bone::LForearm2,
        Bone::LPalm,
        Bone::RCollarbone,
        Bone::RUpperarm,
        Bone::RForearm1,
        Bone::RForearm2,
        Bone::RPalm,
        Bone::Neck,
        Bone::Head,
    ];

    /// Position in [`Bone::ALL`]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Slot in the entity's bone list for the stock rig
    pub const fn default_slot(self) -> u32 {
        match self {
            Bone::Root => 0,
            Bone::Pelvis => 14,
            Bone::LThigh1 => 15,
            Bone::LThigh2 => 16,
            Bone::LCalf => 17,
            Bone::LFoot => 18,
            Bone::RThigh1 => 20,
            Bone::RThigh2 => 21,
            Bone::RCalf => 22,
            Bone::RFoot => 23,
            Bone::Spine1 => 29,
            Bone::Spine2 => 36,
            Bone::Spine3 => 37,
            Bone::LCollarbone => 89,
            Bone::LUpperarm => 90,
            Bone::LForearm1 => 91,
            Bone::LForearm2 => 92,
            Bone::LPalm => 94,
            Bone::RCollarbone => 110,
            Bone::RUpperarm => 111,
            Bone::RForearm1 => 112,
            Bone::RForearm2 => 113,
            Bone::RPalm => 115,
            Bone::Neck => 132,
            Bone::Head => 133,
        }
    }
}

/// Line segments drawn for a skeleton, in buffer order
pub const SEGMENTS: [(Bone, Bone); 13] = [
    (Bone::Head, Bone::Neck),
    (Bone::Neck, Bone::Spine3),
    (Bone::Spine3, Bone::Spine2),
    (Bone::Spine2, Bone::Spine1),
    (Bone::Spine1, Bone::Pelvis),
    (Bone::Pelvis, Bone::LCalf),
    (Bone::LCalf, Bone::LFoot),
    (Bone::Pelvis, Bone::RCalf),
    (Bone::RCalf, Bone::RFoot),
    (Bone::LCollarbone, Bone::LForearm1),
    (Bone::LForearm1, Bone::LPalm),
    (Bone::RCollarbone, Bone::RForearm1),
    (Bone::RForearm1, Bone::RPalm),
];

/// Points in a complete segment buffer
pub const SEGMENT_POINTS: usize = SEGMENTS.len() * 2;

/// Joints the segment buffer needs
pub const REQUIRED: [Bone; 16] = [
    Bone::Head,
    Bone::Neck,
    Bone::Spine3,
    Bone::Spine2,
    Bone::Spine1,
    Bone::Pelvis,
    Bone::LCalf,
    Bone::LFoot,
    Bone::RCalf,
    Bone::RFoot,
    Bone::LCollarbone,
    Bone::LForearm1,
    Bone::LPalm,
    Bone::RCollarbone,
    Bone::RForearm1,
    Bone::RPalm,
];
