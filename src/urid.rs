//! Process-wide URI ↔ URID interning.
//!
//! Shared between the engine threads and all plugin instances.  The lock is
//! only contended during the first call with a new URI (which happens at
//! startup or instantiation time, not during RT processing); lookups of
//! already-interned URIs take the read path.

use std::collections::HashMap;
use std::ffi::{CStr, CString, c_char, c_void};
use std::sync::Arc;

use lv2_raw::urid::{LV2Urid, LV2UridMap, LV2UridMapHandle};
use parking_lot::RwLock;

/// Interned identifier for a URI string.  0 is reserved (invalid).
pub type Urid = u32;

pub struct UridMap {
    inner: RwLock<UridMapInner>,
}

struct UridMapInner {
    uri_to_id: HashMap<String, Urid>,
    /// Null-terminated copies so `unmap` can hand out stable C pointers.
    id_to_uri: Vec<CString>,
}

impl UridMap {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(UridMapInner {
                uri_to_id: HashMap::new(),
                // ID 0 is reserved, so start with a dummy entry
                id_to_uri: vec![CString::default()],
            }),
        })
    }

    /// Map a URI string to a URID, assigning a new ID on first sight.
    /// Returns 0 only for the empty string.
    pub fn map(&self, uri: &str) -> Urid {
        if uri.is_empty() {
            return 0;
        }
        if let Some(&id) = self.inner.read().uri_to_id.get(uri) {
            return id;
        }
        let mut inner = self.inner.write();
        // Another thread may have won the race between the two locks.
        if let Some(&id) = inner.uri_to_id.get(uri) {
            return id;
        }
        let id = inner.id_to_uri.len() as Urid;
        inner.uri_to_id.insert(uri.to_string(), id);
        inner
            .id_to_uri
            .push(CString::new(uri).unwrap_or_default());
        id
    }

    /// Reverse-map a URID back to its URI string.
    pub fn unmap(&self, urid: Urid) -> Option<String> {
        let inner = self.inner.read();
        inner
            .id_to_uri
            .get(urid as usize)
            .filter(|s| !s.as_bytes().is_empty())
            .map(|s| s.to_string_lossy().into_owned())
    }

    /// Create an `LV2UridMap` struct pointing to this map.
    ///
    /// The returned struct holds a raw pointer to `self`, so the caller
    /// must ensure this `UridMap` outlives all plugin instances.
    pub fn as_lv2_urid_map(&self) -> LV2UridMap {
        LV2UridMap {
            handle: self as *const UridMap as LV2UridMapHandle,
            map: urid_map_callback,
        }
    }

    /// Create the unmap counterpart (`LV2_URID_Unmap` is not covered by
    /// lv2_raw, so the C layout lives in [`LV2UridUnmap`] below).
    pub fn as_lv2_urid_unmap(&self) -> LV2UridUnmap {
        LV2UridUnmap {
            handle: self as *const UridMap as *mut c_void,
            unmap: urid_unmap_callback,
        }
    }

    /// Build the urid:map `LV2Feature`.
    ///
    /// # Safety
    /// `map_struct` must come from [`as_lv2_urid_map`] on a `UridMap` that
    /// outlives every plugin using the feature.
    pub unsafe fn make_map_feature(map_struct: *mut LV2UridMap) -> lv2_raw::core::LV2Feature {
        const URID_MAP_URI: &CStr = c"http://lv2plug.in/ns/ext/urid#map";
        lv2_raw::core::LV2Feature {
            uri: URID_MAP_URI.as_ptr(),
            data: map_struct as *mut c_void,
        }
    }

    /// Build the urid:unmap `LV2Feature`.
    ///
    /// # Safety
    /// Same lifetime contract as [`make_map_feature`].
    pub unsafe fn make_unmap_feature(unmap_struct: *mut LV2UridUnmap) -> lv2_raw::core::LV2Feature {
        const URID_UNMAP_URI: &CStr = c"http://lv2plug.in/ns/ext/urid#unmap";
        lv2_raw::core::LV2Feature {
            uri: URID_UNMAP_URI.as_ptr(),
            data: unmap_struct as *mut c_void,
        }
    }
}

/// C layout of `LV2_URID_Unmap` (lv2/urid/urid.h).
#[repr(C)]
pub struct LV2UridUnmap {
    pub handle: *mut c_void,
    pub unmap: extern "C" fn(handle: *mut c_void, urid: LV2Urid) -> *const c_char,
}

extern "C" fn urid_map_callback(handle: LV2UridMapHandle, uri: *const c_char) -> LV2Urid {
    if handle.is_null() || uri.is_null() {
        return 0;
    }
    let map = unsafe { &*(handle as *const UridMap) };
    let c_str = unsafe { CStr::from_ptr(uri) };
    match c_str.to_str() {
        Ok(s) => map.map(s),
        Err(_) => 0,
    }
}

extern "C" fn urid_unmap_callback(handle: *mut c_void, urid: LV2Urid) -> *const c_char {
    if handle.is_null() {
        return std::ptr::null();
    }
    let map = unsafe { &*(handle as *const UridMap) };
    let inner = map.inner.read();
    match inner.id_to_uri.get(urid as usize) {
        // The CString storage is append-only and boxed, so the pointer
        // stays valid for the process lifetime.
        Some(s) if !s.as_bytes().is_empty() => s.as_ptr(),
        _ => std::ptr::null(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_is_monotonic_and_stable() {
        let map = UridMap::new();
        let a = map.map("urn:test:a");
        let b = map.map("urn:test:b");
        assert_eq!(a + 1, b);
        assert_eq!(map.map("urn:test:a"), a);
        assert_eq!(map.unmap(a).as_deref(), Some("urn:test:a"));
        assert_eq!(map.unmap(0), None);
        assert_eq!(map.unmap(9999), None);
    }
}
