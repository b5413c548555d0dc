//! Wire headers carried at the front of every cross-plugin payload.
//!
//! Fields are written in the producer's native byte order. A consumer
//! recognises a byte-swapped producer from the signature and swaps the
//! header fields back on decode; content bytes are never touched.

use std::sync::atomic::{AtomicU32, Ordering};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{Result, VmiopError};
use crate::types::PluginClass;


pub const MESSAGE_SIGNATURE: u32 = 0x4f49_4d56;


/// 1.0.0
pub const MESSAGE_VERSION: u32 = 0x0001_0000;


/// Display number addressing every display.
pub const DISPLAY_ALL: u32 = u32::MAX;


/// Common header.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MessageHeader {
    pub signature: u32,
    pub version: u32,
    /// Total header length, class-specific part included.
    pub header_length: u32,
    /// Class of the original source.
    pub message_class: u32,
    pub sequence: u32,
    pub pad: u32,
}


/// Header of display and presentation messages.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct TypedMessageHeader {
    pub common: MessageHeader,
    pub type_code: u32,
    pub content_length: u32,
    pub display_number: u32,
}


const _: () = assert!(std::mem::size_of::<MessageHeader>() == 24);
const _: () = assert!(std::mem::size_of::<TypedMessageHeader>() == 36);


impl MessageHeader {
    pub const SIZE: usize = std::mem::size_of::<MessageHeader>();

    pub fn new(class: PluginClass, header_length: u32, sequence: u32) -> Self {
        Self {
            signature: MESSAGE_SIGNATURE,
            version: MESSAGE_VERSION,
            header_length,
            message_class: class.raw(),
            sequence,
            pad: 0,
        }
    }

    fn swap_bytes(self) -> Self {
        Self {
            signature: self.signature.swap_bytes(),
            version: self.version.swap_bytes(),
            header_length: self.header_length.swap_bytes(),
            message_class: self.message_class.swap_bytes(),
            sequence: self.sequence.swap_bytes(),
            pad: self.pad.swap_bytes(),
        }
    }

    /// Decodes the common header at the start of `bytes`. Returns the
    /// header in native order and whether the producer's order differed.
    pub fn decode(bytes: &[u8]) -> Result<(MessageHeader, bool)> {
        let (raw, _) = MessageHeader::read_from_prefix(bytes).map_err(|_| VmiopError::Range)?;
        let (header, swapped) = if raw.signature == MESSAGE_SIGNATURE {
            (raw, false)
        } else if raw.signature.swap_bytes() == MESSAGE_SIGNATURE {
            (raw.swap_bytes(), true)
        } else {
            return Err(VmiopError::Inval);
        };
        if header.version >> 16 != MESSAGE_VERSION >> 16 {
            return Err(VmiopError::Inval);
        }
        let length = header.header_length as usize;
        if length < Self::SIZE || length > bytes.len() {
            return Err(VmiopError::Range);
        }
        Ok((header, swapped))
    }

    pub fn class(&self) -> Option<PluginClass> {
        PluginClass::from_raw(self.message_class)
    }
}


impl TypedMessageHeader {
    pub const SIZE: usize = std::mem::size_of::<TypedMessageHeader>();
}


#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DisplayType {
    /// Discard only.
    Null = 0,
    Frame = 1,
    EdidRequest = 2,
    GetConfiguration = 3,
    SetConfiguration = 4,
    HdcpRequest = 5,
    GetMemoryOptimizationInfo = 6,
    SetVncConsoleState = 7,
}


impl DisplayType {
    pub const fn from_raw(raw: u32) -> Option<Self> {
        use DisplayType::*;
        Some(match raw {
            0 => Null,
            1 => Frame,
            2 => EdidRequest,
            3 => GetConfiguration,
            4 => SetConfiguration,
            5 => HdcpRequest,
            6 => GetMemoryOptimizationInfo,
            7 => SetVncConsoleState,
            _ => return None,
        })
    }
}


#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PresentationType {
    Null = 0,
    EdidReport = 1,
}


impl PresentationType {
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(PresentationType::Null),
            1 => Some(PresentationType::EdidReport),
            _ => None,
        }
    }
}


#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Display(DisplayType),
    Presentation(PresentationType),
    /// Class without a typed header; content follows the common header.
    Other(u32),
}


impl MessageKind {
    fn class(self) -> Option<PluginClass> {
        match self {
            MessageKind::Display(_) => Some(PluginClass::Display),
            MessageKind::Presentation(_) => Some(PluginClass::Presentation),
            MessageKind::Other(class) => PluginClass::from_raw(class),
        }
    }

    fn type_code(self) -> u32 {
        match self {
            MessageKind::Display(t) => t as u32,
            MessageKind::Presentation(t) => t as u32,
            MessageKind::Other(_) => 0,
        }
    }
}


/// Decoded view of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Message<'a> {
    pub header: MessageHeader,
    pub kind: MessageKind,
    pub display_number: u32,
    pub content: &'a [u8],
    pub byte_swapped: bool,
}


/// Parses a message from the bytes of its first buffer element.
pub fn parse(bytes: &[u8]) -> Result<Message<'_>> {
    let (header, byte_swapped) = MessageHeader::decode(bytes)?;
    let header_length = header.header_length as usize;
    let class = header.class();
    if !matches!(class, Some(PluginClass::Display | PluginClass::Presentation)) {
        return Ok(Message {
            header,
            kind: MessageKind::Other(header.message_class),
            display_number: DISPLAY_ALL,
            content: &bytes[header_length..],
            byte_swapped,
        });
    }

    if header_length < TypedMessageHeader::SIZE {
        return Err(VmiopError::Range);
    }
    let (typed, _) = TypedMessageHeader::read_from_prefix(bytes).map_err(|_| VmiopError::Range)?;
    let fix = |v: u32| if byte_swapped { v.swap_bytes() } else { v };
    let type_code = fix(typed.type_code);
    let kind = match class {
        Some(PluginClass::Display) => MessageKind::Display(DisplayType::from_raw(type_code).ok_or(VmiopError::Inval)?),
        _ => MessageKind::Presentation(PresentationType::from_raw(type_code).ok_or(VmiopError::Inval)?),
    };
    let end = header_length
        .checked_add(fix(typed.content_length) as usize)
        .ok_or(VmiopError::Range)?;
    let content = bytes.get(header_length..end).ok_or(VmiopError::Range)?;
    Ok(Message { header, kind, display_number: fix(typed.display_number), content, byte_swapped })
}


/// Bytes needed for a message of `kind` with `content_len` bytes of content.
pub fn encoded_len(kind: MessageKind, content_len: usize) -> usize {
    header_len(kind) + content_len
}


fn header_len(kind: MessageKind) -> usize {
    match kind {
        MessageKind::Other(_) => MessageHeader::SIZE,
        _ => TypedMessageHeader::SIZE,
    }
}


/// Writes a complete message into `out` and returns the bytes used.
pub fn write(out: &mut [u8], kind: MessageKind, sequence: u32, display_number: u32, content: &[u8]) -> Result<usize> {
    let class = kind.class().ok_or(VmiopError::Inval)?;
    let header_length = header_len(kind);
    let total = header_length.checked_add(content.len()).ok_or(VmiopError::Range)?;
    if out.len() < total {
        return Err(VmiopError::Range);
    }
    let content_length = u32::try_from(content.len()).map_err(|_| VmiopError::Range)?;
    let common = MessageHeader::new(class, header_length as u32, sequence);
    match kind {
        MessageKind::Other(_) => common.write_to_prefix(out).map_err(|_| VmiopError::Range)?,
        _ => TypedMessageHeader { common, type_code: kind.type_code(), content_length, display_number }
            .write_to_prefix(out)
            .map_err(|_| VmiopError::Range)?,
    }
    out[header_length..total].copy_from_slice(content);
    Ok(total)
}


/// Owned encoding of a message.
pub fn encode(kind: MessageKind, sequence: u32, display_number: u32, content: &[u8]) -> Result<Vec<u8>> {
    let mut out = vec![0u8; encoded_len(kind, content.len())];
    write(&mut out, kind, sequence, display_number, content)?;
    Ok(out)
}


/// Per-source message sequence, starting at 0 and wrapping.
#[derive(Debug, Default)]
pub struct SequenceCounter(AtomicU32);


impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    pub fn peek(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}
