//! Per-port buffers.
//!
//! Every buffer is backed by `u64` storage so the pointer handed to
//! `connect_port` is 8-byte aligned regardless of the port type.  Buffers
//! are allocated on the worker thread when a module is instantiated and
//! only ever written on the RT thread afterwards.

use std::ffi::c_void;

use crate::atom;
use crate::plugin::types::PortType;
use crate::urid::Urid;

/// Default atom sequence capacity when the port does not request one.
pub const DEFAULT_ATOM_CAPACITY: usize = 64 * 1024;

/// 8-byte aligned, heap-allocated byte storage.
pub struct AlignedBuf {
    raw: Vec<u64>,
    len: usize,
}

impl AlignedBuf {
    pub fn zeroed(len_bytes: usize) -> Self {
        let words = len_bytes.div_ceil(8).max(1);
        AlignedBuf {
            raw: vec![0u64; words],
            len: len_bytes,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_ptr(&mut self) -> *mut c_void {
        self.raw.as_mut_ptr() as *mut c_void
    }

    /// Pointer for sharing a buffer with another module's `connect_port`.
    /// The storage never moves after allocation; writes only ever happen
    /// through the FFI boundary under the barrier ordering.
    #[inline]
    pub fn shared_ptr(&self) -> *mut c_void {
        self.raw.as_ptr() as *mut c_void
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.raw.as_ptr() as *const u8, self.len) }
    }

    #[inline]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.raw.as_mut_ptr() as *mut u8, self.len) }
    }

    #[inline]
    pub fn f32s(&self) -> &[f32] {
        unsafe { std::slice::from_raw_parts(self.raw.as_ptr() as *const f32, self.len / 4) }
    }

    #[inline]
    pub fn f32s_mut(&mut self) -> &mut [f32] {
        unsafe { std::slice::from_raw_parts_mut(self.raw.as_mut_ptr() as *mut f32, self.len / 4) }
    }
}

/// The buffer of one port, typed per the port's class.
pub struct PortBuf {
    ty: PortType,
    data: AlignedBuf,
}

impl PortBuf {
    pub fn new(ty: PortType, nframes: u32, atom_capacity: u32, default: f32) -> Self {
        let bytes = match ty {
            PortType::Audio | PortType::Cv => nframes as usize * 4,
            PortType::Control => 8,
            PortType::Atom => {
                if atom_capacity == 0 {
                    DEFAULT_ATOM_CAPACITY
                } else {
                    (atom_capacity as usize).max(atom::SEQ_HEADER)
                }
            }
        };
        let mut buf = PortBuf {
            ty,
            data: AlignedBuf::zeroed(bytes),
        };
        if ty == PortType::Control {
            buf.set_control(default);
        }
        buf
    }

    #[inline]
    pub fn ty(&self) -> PortType {
        self.ty
    }

    /// Stable pointer for `connect_port`.
    #[inline]
    pub fn as_ptr(&mut self) -> *mut c_void {
        self.data.as_ptr()
    }

    /// Stable pointer obtainable through a shared borrow; see
    /// [`AlignedBuf::shared_ptr`].
    #[inline]
    pub fn shared_ptr(&self) -> *mut c_void {
        self.data.shared_ptr()
    }

    // ── Control ──

    #[inline]
    pub fn control(&self) -> f32 {
        self.data.f32s()[0]
    }

    #[inline]
    pub fn set_control(&mut self, value: f32) {
        self.data.f32s_mut()[0] = value;
    }

    // ── Audio / CV ──

    #[inline]
    pub fn stream(&self, nframes: u32) -> &[f32] {
        &self.data.f32s()[..nframes as usize]
    }

    #[inline]
    pub fn stream_mut(&mut self, nframes: u32) -> &mut [f32] {
        &mut self.data.f32s_mut()[..nframes as usize]
    }

    pub fn zero_stream(&mut self, nframes: u32) {
        self.stream_mut(nframes).fill(0.0);
    }

    // ── Atom ──

    #[inline]
    pub fn atom_bytes(&self) -> &[u8] {
        self.data.bytes()
    }

    #[inline]
    pub fn atom_bytes_mut(&mut self) -> &mut [u8] {
        self.data.bytes_mut()
    }

    /// Reset as an empty input sequence ready for event injection.
    pub fn reset_atom_input(&mut self, sequence_urid: Urid) {
        atom::init_sequence(self.data.bytes_mut(), false, sequence_urid);
    }

    /// Reset as a writable output sequence advertising its full capacity.
    pub fn reset_atom_output(&mut self, sequence_urid: Urid) {
        atom::init_sequence(self.data.bytes_mut(), true, sequence_urid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_are_aligned_and_sized() {
        let mut audio = PortBuf::new(PortType::Audio, 512, 0, 0.0);
        assert_eq!(audio.as_ptr() as usize % 8, 0);
        assert_eq!(audio.stream(512).len(), 512);
        audio.zero_stream(512);
        assert!(audio.stream(512).iter().all(|&s| s == 0.0));

        let control = PortBuf::new(PortType::Control, 512, 0, 0.7);
        assert_eq!(control.control(), 0.7);

        let atom_buf = PortBuf::new(PortType::Atom, 512, 0, 0.0);
        assert_eq!(atom_buf.atom_bytes().len(), DEFAULT_ATOM_CAPACITY);

        let small = PortBuf::new(PortType::Atom, 512, 1024, 0.0);
        assert_eq!(small.atom_bytes().len(), 1024);
    }

    #[test]
    fn atom_reset_roundtrip() {
        let map = crate::urid::UridMap::new();
        let seq = map.map("http://lv2plug.in/ns/ext/atom#Sequence");
        let mut buf = PortBuf::new(PortType::Atom, 64, 256, 0.0);

        buf.reset_atom_input(seq);
        assert!(!atom::sequence_has_events(buf.atom_bytes()));
        assert!(atom::sequence_append(buf.atom_bytes_mut(), 0, 77, &[1, 2, 3]));
        assert!(atom::sequence_has_events(buf.atom_bytes()));

        buf.reset_atom_input(seq);
        assert!(!atom::sequence_has_events(buf.atom_bytes()));
    }
}
