//! Host runtime contract
//!
//! The bridge never inspects host objects itself. Everything it needs goes
//! through [`HostRuntime`]: fetch a named attribute, check that one exists,
//! call an object with positional arguments, build a handful of primitive
//! values, and move values across the native boundary as [`RawHostRef`]s.
//!
//! Attribute names are interned once per process in an [`AttributeCache`]
//! owned by the runtime implementation.

use std::sync::OnceLock;

use super::error::{HostError, HostResult};
use super::symbols::RawHostRef;

/// Well-known attribute names the bridge looks up on host objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attr {
    /// Primary rule handler (`_handle`)
    Handle,
    /// Optional observer called after the handler (`hook_handler`)
    HookHandler,
    /// Optional hook called before each read (`hook_read_before`)
    HookReadBefore,
    /// Input read method (`read`)
    Read,
    /// Optional hook that may replace the text just read (`hook_read_after`)
    HookReadAfter,
    /// Input file object (`file`)
    File,
    /// Close method of the file object (`close`)
    Close,
    /// Closed flag of the file object (`closed`)
    Closed,
}

impl Attr {
    /// Every well-known attribute, in cache order
    pub const ALL: [Attr; 8] = [
        Attr::Handle,
        Attr::HookHandler,
        Attr::HookReadBefore,
        Attr::Read,
        Attr::HookReadAfter,
        Attr::File,
        Attr::Close,
        Attr::Closed,
    ];

    /// Attribute name as the host sees it
    pub fn as_str(self) -> &'static str {
        match self {
            Attr::Handle => "_handle",
            Attr::HookHandler => "hook_handler",
            Attr::HookReadBefore => "hook_read_before",
            Attr::Read => "read",
            Attr::HookReadAfter => "hook_read_after",
            Attr::File => "file",
            Attr::Close => "close",
            Attr::Closed => "closed",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Process-wide table of interned attribute names
///
/// Filled at most once, on first use, and never released: interned names
/// live as long as the process. Concurrent first uses are serialized by the
/// inner [`OnceLock`]; a failed initialization leaves the cache empty and
/// the next call retries.
pub struct AttributeCache<N> {
    names: OnceLock<[N; 8]>,
}

impl<N> AttributeCache<N> {
    /// Create an empty cache (usable in `static` items)
    pub const fn new() -> Self {
        Self {
            names: OnceLock::new(),
        }
    }

    /// True once every name has been interned
    pub fn is_initialized(&self) -> bool {
        self.names.get().is_some()
    }

    /// Interned handle for `attr`, interning the whole table on first use
    pub fn get_or_init<F>(&self, attr: Attr, intern: F) -> HostResult<&N>
    where
        F: FnMut(&'static str) -> HostResult<N>,
    {
        if let Some(names) = self.names.get() {
            return Ok(&names[attr.index()]);
        }

        let table = Self::intern_all(intern)?;
        // A racing initializer may have won; either table is equivalent.
        let names = self.names.get_or_init(|| table);
        Ok(&names[attr.index()])
    }

    fn intern_all<F>(mut intern: F) -> HostResult<[N; 8]>
    where
        F: FnMut(&'static str) -> HostResult<N>,
    {
        let [a, b, c, d, e, f, g, h] = Attr::ALL;
        Ok([
            intern(a.as_str())?,
            intern(b.as_str())?,
            intern(c.as_str())?,
            intern(d.as_str())?,
            intern(e.as_str())?,
            intern(f.as_str())?,
            intern(g.as_str())?,
            intern(h.as_str())?,
        ])
    }
}

impl<N> Default for AttributeCache<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// The subset of a host scripting runtime the bridge relies on
///
/// # Raw handles
///
/// Values cross into native code through [`export`](HostRuntime::export),
/// which hands one strong reference to the native side. Native code gives
/// values back by address; [`borrow_raw`](HostRuntime::borrow_raw) takes a
/// new reference without consuming the native one, and
/// [`release_raw`](HostRuntime::release_raw) drops a native reference.
pub trait HostRuntime {
    /// A reference to a host value
    type Object: Clone;

    /// Interned attribute-name handle
    type Name;

    /// The runtime's attribute-name cache
    fn names(&self) -> &AttributeCache<Self::Name>;

    /// Intern one attribute name
    fn intern(&self, name: &'static str) -> HostResult<Self::Name>;

    /// Fetch a named attribute; absence is [`HostError::MissingAttribute`]
    fn get_attr(&self, object: &Self::Object, name: &Self::Name) -> HostResult<Self::Object>;

    /// Check whether a named attribute exists
    fn has_attr(&self, object: &Self::Object, name: &Self::Name) -> bool;

    /// Call `callable` with positional arguments
    fn call(&self, callable: &Self::Object, args: &[Self::Object]) -> HostResult<Self::Object>;

    /// Build a host string
    fn new_str(&self, value: &str) -> HostResult<Self::Object>;

    /// Build a host string from bytes that need not be UTF-8
    fn new_bytes(&self, value: &[u8]) -> HostResult<Self::Object>;

    /// Build a host integer
    fn new_int(&self, value: i64) -> HostResult<Self::Object>;

    /// Build a host list
    fn new_list(&self, items: Vec<Self::Object>) -> HostResult<Self::Object>;

    /// Build a host list of strings
    ///
    /// Runtimes with a tracing collector override this so each string is
    /// reachable from the list as soon as it exists.
    fn new_str_list(&self, items: &[String]) -> HostResult<Self::Object> {
        let items = items
            .iter()
            .map(|item| self.new_str(item))
            .collect::<HostResult<Vec<_>>>()?;
        self.new_list(items)
    }

    /// Bytes of a host text value
    fn text_bytes(&self, value: &Self::Object) -> HostResult<Vec<u8>>;

    /// Truthiness of a host value
    fn is_truthy(&self, value: &Self::Object) -> HostResult<bool>;

    /// Take an exception the runtime itself holds pending, if it has such
    /// a notion
    fn take_pending_error(&self) -> Option<HostError> {
        None
    }

    /// Move a value to the native side
    fn export(&self, value: Self::Object) -> RawHostRef;

    /// New reference to a value held by the native side
    ///
    /// # Safety
    ///
    /// `raw` must come from [`export`](HostRuntime::export) on this runtime
    /// and must not have been released.
    unsafe fn borrow_raw(&self, raw: RawHostRef) -> Self::Object;

    /// Drop a reference held by the native side
    ///
    /// # Safety
    ///
    /// `raw` must come from [`export`](HostRuntime::export) on this runtime
    /// and must not be used afterwards.
    unsafe fn release_raw(&self, raw: RawHostRef);

    // === Provided helpers ===

    /// Interned handle of a well-known attribute
    fn attr_name(&self, attr: Attr) -> HostResult<&Self::Name> {
        self.names().get_or_init(attr, |name| self.intern(name))
    }

    /// Fetch a well-known attribute
    fn attr(&self, object: &Self::Object, attr: Attr) -> HostResult<Self::Object> {
        let name = self.attr_name(attr)?;
        self.get_attr(object, name)
    }

    /// Check a well-known attribute
    fn has(&self, object: &Self::Object, attr: Attr) -> HostResult<bool> {
        let name = self.attr_name(attr)?;
        Ok(self.has_attr(object, name))
    }

    /// Fetch a well-known attribute that may be absent
    fn attr_optional(&self, object: &Self::Object, attr: Attr) -> HostResult<Option<Self::Object>> {
        if !self.has(object, attr)? {
            return Ok(None);
        }
        self.attr(object, attr).map(Some)
    }
}
