//! In-process host runtime
//!
//! [`NativeRuntime`] implements [`HostRuntime`] over reference-counted
//! [`Value`]s, so compiled parsers can be driven from plain Rust. Host
//! objects are attribute maps; callables are Rust closures.
//!
//! [`NativeParser`] builds the parser object the bridge expects:
//!
//! ```
//! use bisonlink::engine::{NativeParser, Value};
//!
//! let parser = NativeParser::new()
//!     .on("expr_plus", |call| Ok(Value::int(call.int_arg(0)? + call.int_arg(1)?)))
//!     .input("1 + 2\n".as_bytes())
//!     .build();
//! assert!(parser.get_attr("_handle").is_some());
//! assert!(parser.get_attr("file").is_some());
//! ```
//!
//! Rules without a registered handler produce a [`ParseNode`]. The result
//! of the most recent rule is kept on the parser as `last`. Nodes serialize
//! to JSON and load back with [`ParseNode::from_json`].
//!
//! Input read through [`NativeParser::input`] is handed over as raw bytes;
//! the source does not have to be UTF-8.

use std::cell::RefCell;
use std::fmt;
use std::io::{self, Read};
use std::rc::{Rc, Weak};

use hashbrown::HashMap;
use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::error::{HostError, HostResult};
use super::host::{AttributeCache, HostRuntime};
use super::symbols::RawHostRef;

/// Shared reference to a native value
pub type ValueRef = Rc<Value>;

/// Native callable: positional arguments in, one value out
pub type NativeFn = Rc<dyn Fn(&[ValueRef]) -> HostResult<ValueRef>>;

type RuleHandler = Rc<dyn Fn(&RuleCall<'_>) -> HostResult<ValueRef>>;

/// Attribute under which the parser keeps the latest rule result
pub const LAST_RESULT: &str = "last";

/// Read size used to refill an [`InputSource`]
const READ_CHUNK: usize = 8 * 1024;

// ============================================================================
// Values
// ============================================================================

/// A host value
pub enum Value {
    /// Absent value
    Nil,
    /// Boolean
    Bool(bool),
    /// Integer
    Int(i64),
    /// Text
    Str(String),
    /// Raw bytes, such as input that is not UTF-8
    Bytes(Vec<u8>),
    /// Ordered sequence
    List(Vec<ValueRef>),
    /// Default rule result
    Node(ParseNode),
    /// Attribute map
    Object(Object),
    /// Rust closure
    Callable(NativeFn),
}

impl Value {
    /// Nil value
    pub fn nil() -> ValueRef {
        Rc::new(Value::Nil)
    }

    /// Boolean value
    pub fn bool(value: bool) -> ValueRef {
        Rc::new(Value::Bool(value))
    }

    /// Integer value
    pub fn int(value: i64) -> ValueRef {
        Rc::new(Value::Int(value))
    }

    /// Text value
    pub fn str(value: &str) -> ValueRef {
        Rc::new(Value::Str(value.to_string()))
    }

    /// Byte string value
    pub fn bytes(value: &[u8]) -> ValueRef {
        Rc::new(Value::Bytes(value.to_vec()))
    }

    /// List value
    pub fn list(items: Vec<ValueRef>) -> ValueRef {
        Rc::new(Value::List(items))
    }

    /// Node value
    pub fn node(node: ParseNode) -> ValueRef {
        Rc::new(Value::Node(node))
    }

    /// Object with the given attributes
    pub fn object(attrs: Vec<(&str, ValueRef)>) -> ValueRef {
        let object = Object::new();
        for (name, value) in attrs {
            object.set(name, value);
        }
        Rc::new(Value::Object(object))
    }

    /// Callable value
    pub fn callable<F>(f: F) -> ValueRef
    where
        F: Fn(&[ValueRef]) -> HostResult<ValueRef> + 'static,
    {
        Rc::new(Value::Callable(Rc::new(f)))
    }

    /// Type name used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Node(_) => "node",
            Value::Object(_) => "object",
            Value::Callable(_) => "callable",
        }
    }

    /// True for [`Value::Nil`]
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Boolean payload
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer payload
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Text payload; byte strings qualify when they are valid UTF-8
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Bytes of a text or byte string value
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Str(s) => Some(s.as_bytes()),
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// List payload
    pub fn as_list(&self) -> Option<&[ValueRef]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Node payload
    pub fn as_node(&self) -> Option<&ParseNode> {
        match self {
            Value::Node(node) => Some(node),
            _ => None,
        }
    }

    /// Object payload
    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(object) => Some(object),
            _ => None,
        }
    }

    /// Attribute of an object value
    pub fn get_attr(&self, name: &str) -> Option<ValueRef> {
        self.as_object().and_then(|object| object.get(name))
    }

    /// Truthiness: nil, false, zero and empty text, bytes or lists are false
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Nil => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Str(s) => !s.is_empty(),
            Value::Bytes(b) => !b.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Node(_) | Value::Object(_) | Value::Callable(_) => true,
        }
    }

    fn type_error(&self, expected: &str) -> HostError {
        HostError::TypeMismatch {
            expected: expected.to_string(),
            actual: self.type_name().to_string(),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "Nil"),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::Int(i) => write!(f, "Int({})", i),
            Value::Str(s) => write!(f, "Str({:?})", s),
            Value::Bytes(b) => write!(f, "Bytes({:?})", b),
            Value::List(items) => f.debug_list().entries(items.iter()).finish(),
            Value::Node(node) => fmt::Debug::fmt(node, f),
            Value::Object(object) => fmt::Debug::fmt(object, f),
            Value::Callable(_) => write!(f, "<callable>"),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Nil => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Str(s) => serializer.serialize_str(s),
            Value::Bytes(b) => match std::str::from_utf8(b) {
                Ok(s) => serializer.serialize_str(s),
                Err(_) => serializer.serialize_bytes(b),
            },
            Value::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item.as_ref())?;
                }
                seq.end()
            }
            Value::Node(node) => node.serialize(serializer),
            Value::Object(object) => object.serialize(serializer),
            Value::Callable(_) => serializer.serialize_str("<callable>"),
        }
    }
}

/// Attribute map with interior mutability
#[derive(Default)]
pub struct Object {
    attrs: RefCell<HashMap<String, ValueRef>>,
}

impl Object {
    /// Empty object
    pub fn new() -> Self {
        Self::default()
    }

    /// Attribute value
    pub fn get(&self, name: &str) -> Option<ValueRef> {
        self.attrs.borrow().get(name).cloned()
    }

    /// Set or replace an attribute
    pub fn set(&self, name: &str, value: ValueRef) {
        self.attrs.borrow_mut().insert(name.to_string(), value);
    }

    /// Check whether an attribute is set
    pub fn has(&self, name: &str) -> bool {
        self.attrs.borrow().contains_key(name)
    }

    /// Attribute names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.attrs.borrow().keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("attrs", &self.names())
            .finish()
    }
}

impl Serialize for Object {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let names = self.names();
        let attrs = self.attrs.borrow();
        let mut map = serializer.serialize_map(None)?;
        for name in &names {
            if let Some(value) = attrs.get(name) {
                // Functions are behavior, not data.
                if !matches!(value.as_ref(), Value::Callable(_)) {
                    map.serialize_entry(name, value.as_ref())?;
                }
            }
        }
        map.end()
    }
}

// ============================================================================
// Parse nodes
// ============================================================================

/// Result of a rule that has no registered handler
#[derive(Debug)]
pub struct ParseNode {
    /// Rule name
    pub target: String,
    /// Option code of the matched alternative
    pub option: i64,
    /// Argument names, paired with `values`
    pub names: Vec<String>,
    /// Argument values
    pub values: Vec<ValueRef>,
}

impl ParseNode {
    /// Value of a named argument
    pub fn get(&self, name: &str) -> Option<&ValueRef> {
        self.names
            .iter()
            .position(|n| n == name)
            .and_then(|i| self.values.get(i))
    }

    /// Load a tree written by `serde_json::to_string`
    ///
    /// Text leaves come back as [`Value::Str`]; byte strings that are not
    /// UTF-8 come back as lists of integers.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Node from the `args` list of its serialized form: `[[name, value], ...]`
    fn from_parts(target: String, option: i64, args: Vec<ValueRef>) -> Result<Self, String> {
        let mut names = Vec::with_capacity(args.len());
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            match arg.as_list() {
                Some([name, value]) => {
                    let name = name.as_str().ok_or_else(|| {
                        format!("argument name must be a string, got {}", name.type_name())
                    })?;
                    names.push(name.to_string());
                    values.push(value.clone());
                }
                _ => {
                    return Err(format!(
                        "argument must be a [name, value] pair, got {:?}",
                        arg
                    ))
                }
            }
        }
        Ok(Self {
            target,
            option,
            names,
            values,
        })
    }

    /// Indented tree rendering
    ///
    /// ```text
    /// expr_plus (1)
    ///   left: expr (0)
    ///     number: 3
    ///   right: 4
    /// ```
    pub fn dump(&self) -> String {
        let mut out = String::new();
        self.dump_into(&mut out, 0);
        out
    }

    fn dump_into(&self, out: &mut String, depth: usize) {
        out.push_str(&format!("{} ({})\n", self.target, self.option));
        for (name, value) in self.names.iter().zip(&self.values) {
            out.push_str(&"  ".repeat(depth + 1));
            out.push_str(name);
            out.push_str(": ");
            match value.as_ref() {
                Value::Node(child) => child.dump_into(out, depth + 1),
                Value::Str(s) => out.push_str(&format!("{:?}\n", s)),
                Value::Bytes(b) => {
                    out.push_str(&format!("{:?}\n", String::from_utf8_lossy(b)))
                }
                Value::Int(i) => out.push_str(&format!("{}\n", i)),
                other => out.push_str(&format!("{:?}\n", other)),
            }
        }
    }
}

impl Serialize for ParseNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry("target", &self.target)?;
        map.serialize_entry("option", &self.option)?;
        let args: Vec<(&str, &Value)> = self
            .names
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().map(Rc::as_ref))
            .collect();
        map.serialize_entry("args", &args)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for ParseNode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Node(node) => Ok(node),
            other => Err(de::Error::custom(format!(
                "expected a node, found {}",
                other.type_name()
            ))),
        }
    }
}

/// Builds data values; callables never appear in serialized form
struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a nil, boolean, integer, string, list, node or object value")
    }

    fn visit_unit<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Nil)
    }

    fn visit_none<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Nil)
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Value, E> {
        Ok(Value::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Value, E> {
        Ok(Value::Int(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Value, E> {
        i64::try_from(v)
            .map(Value::Int)
            .map_err(|_| E::custom(format!("integer {} out of range", v)))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Value, E> {
        Ok(Value::Str(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Value, E> {
        Ok(Value::Str(v))
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Value, E> {
        Ok(Value::Bytes(v.to_vec()))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element::<Value>()? {
            items.push(Rc::new(item));
        }
        Ok(Value::List(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Value, A::Error> {
        let mut entries: Vec<(String, Value)> = Vec::new();
        while let Some((key, value)) = map.next_entry::<String, Value>()? {
            entries.push((key, value));
        }

        let is_node = entries.len() == 3
            && ["target", "option", "args"]
                .iter()
                .all(|key| entries.iter().any(|(k, _)| k == key));
        if !is_node {
            let object = Object::new();
            for (key, value) in entries {
                object.set(&key, Rc::new(value));
            }
            return Ok(Value::Object(object));
        }

        let mut target = None;
        let mut option = None;
        let mut args = None;
        for (key, value) in entries {
            match (key.as_str(), value) {
                ("target", Value::Str(s)) => target = Some(s),
                ("option", Value::Int(i)) => option = Some(i),
                ("args", Value::List(items)) => args = Some(items),
                (key, other) => {
                    return Err(de::Error::custom(format!(
                        "node field `{}` has the wrong type: {}",
                        key,
                        other.type_name()
                    )))
                }
            }
        }

        match (target, option, args) {
            (Some(target), Some(option), Some(args)) => ParseNode::from_parts(target, option, args)
                .map(Value::Node)
                .map_err(de::Error::custom),
            _ => Err(de::Error::custom("incomplete node")),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }
}

// ============================================================================
// Rule calls
// ============================================================================

/// Arguments of one rule event, as seen by a registered handler
pub struct RuleCall<'a> {
    /// Rule name
    pub target: &'a str,
    /// Option code of the matched alternative
    pub option: i64,
    /// Argument names
    pub names: &'a [String],
    /// Argument values
    pub values: &'a [ValueRef],
}

impl RuleCall<'_> {
    /// Number of arguments
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when the rule has no arguments
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Positional argument
    pub fn value(&self, index: usize) -> HostResult<&ValueRef> {
        self.values.get(index).ok_or_else(|| {
            HostError::raised(format!(
                "rule `{}` has no argument {} ({} given)",
                self.target,
                index,
                self.values.len()
            ))
        })
    }

    /// Named argument
    pub fn get(&self, name: &str) -> Option<&ValueRef> {
        self.names
            .iter()
            .position(|n| n == name)
            .and_then(|i| self.values.get(i))
    }

    /// Positional argument as an integer
    pub fn int_arg(&self, index: usize) -> HostResult<i64> {
        let value = self.value(index)?;
        value.as_int().ok_or_else(|| value.type_error("int"))
    }

    /// Positional argument as text
    pub fn str_arg(&self, index: usize) -> HostResult<&str> {
        let value = self.value(index)?;
        value.as_str().ok_or_else(|| value.type_error("str"))
    }

    /// Build the default node for this call
    pub fn to_node(&self) -> ParseNode {
        ParseNode {
            target: self.target.to_string(),
            option: self.option,
            names: self.names.to_vec(),
            values: self.values.to_vec(),
        }
    }
}

// ============================================================================
// Input
// ============================================================================

/// Line-at-a-time reader behind a parser's `read` attribute
pub struct InputSource {
    reader: Box<dyn Read>,
    buffer: Vec<u8>,
    eof: bool,
    closed: bool,
}

impl InputSource {
    /// Wrap a reader
    pub fn new(reader: impl Read + 'static) -> Self {
        Self {
            reader: Box::new(reader),
            buffer: Vec::new(),
            eof: false,
            closed: false,
        }
    }

    /// Next line, or at most `max` bytes of it; empty at end of input
    ///
    /// Bytes are returned as read, so a cut may fall inside a multi-byte
    /// character.
    pub fn read_chunk(&mut self, max: usize) -> io::Result<Vec<u8>> {
        if self.closed || max == 0 {
            return Ok(Vec::new());
        }

        loop {
            let window = self.buffer.len().min(max);
            if let Some(pos) = memchr::memchr(b'\n', &self.buffer[..window]) {
                return Ok(self.buffer.drain(..=pos).collect());
            }
            if self.buffer.len() >= max || self.eof {
                return Ok(self.buffer.drain(..window).collect());
            }
            self.refill()?;
        }
    }

    /// Stop reading; later reads return end of input
    pub fn close(&mut self) {
        self.closed = true;
        self.buffer.clear();
    }

    /// True once [`close`](InputSource::close) was called
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn refill(&mut self) -> io::Result<()> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.reader.read(&mut chunk) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(());
                }
                Ok(n) => {
                    self.buffer.extend_from_slice(&chunk[..n]);
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

/// `read` callable and `file` object over one input source
fn input_attributes(source: InputSource) -> (ValueRef, ValueRef) {
    let source = Rc::new(RefCell::new(source));

    let reader = source.clone();
    let read = Value::callable(move |args| {
        let max = size_arg(args)?;
        let bytes = reader
            .borrow_mut()
            .read_chunk(max)
            .map_err(|e| HostError::raised(e.to_string()))?;
        Ok(Value::bytes(&bytes))
    });

    let file = Rc::new_cyclic(|this: &Weak<Value>| {
        let this = this.clone();
        let object = Object::new();
        object.set("closed", Value::bool(false));
        object.set(
            "close",
            Value::callable(move |_| {
                source.borrow_mut().close();
                if let Some(file) = this.upgrade() {
                    if let Some(object) = file.as_object() {
                        object.set("closed", Value::bool(true));
                    }
                }
                Ok(Value::nil())
            }),
        );
        Value::Object(object)
    });

    (read, file)
}

fn size_arg(args: &[ValueRef]) -> HostResult<usize> {
    let value = args
        .first()
        .ok_or_else(|| HostError::raised("read expects a size argument"))?;
    let size = value.as_int().ok_or_else(|| value.type_error("int"))?;
    Ok(usize::try_from(size).unwrap_or(0))
}

// ============================================================================
// Parser builder
// ============================================================================

/// Builder for a native parser object
#[derive(Default)]
pub struct NativeParser {
    handlers: HashMap<String, RuleHandler>,
    observer: Option<NativeFn>,
    before_read: Option<NativeFn>,
    read: Option<ValueRef>,
    after_read: Option<NativeFn>,
    file: Option<ValueRef>,
    attrs: Vec<(String, ValueRef)>,
}

impl NativeParser {
    /// Parser with no handlers, hooks or input
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for one rule
    pub fn on<F>(mut self, target: &str, handler: F) -> Self
    where
        F: Fn(&RuleCall<'_>) -> HostResult<ValueRef> + 'static,
    {
        self.handlers.insert(target.to_string(), Rc::new(handler));
        self
    }

    /// Install the `hook_handler` observer
    ///
    /// It receives `(target, option, names, values, primary)` and its
    /// result replaces the handler's.
    pub fn observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(&[ValueRef]) -> HostResult<ValueRef> + 'static,
    {
        self.observer = Some(Rc::new(observer));
        self
    }

    /// Install the `hook_read_before` hook
    pub fn before_read<F>(mut self, hook: F) -> Self
    where
        F: Fn() -> HostResult<()> + 'static,
    {
        self.before_read = Some(Rc::new(move |_: &[ValueRef]| -> HostResult<ValueRef> {
            hook()?;
            Ok(Value::nil())
        }));
        self
    }

    /// Set the `read(max_size)` method
    pub fn read<F>(mut self, read: F) -> Self
    where
        F: Fn(usize) -> HostResult<ValueRef> + 'static,
    {
        self.read = Some(Value::callable(move |args| read(size_arg(args)?)));
        self
    }

    /// Install the `hook_read_after` hook; its result replaces the text
    pub fn after_read<F>(mut self, hook: F) -> Self
    where
        F: Fn(&[u8]) -> HostResult<ValueRef> + 'static,
    {
        self.after_read = Some(Rc::new(move |args: &[ValueRef]| -> HostResult<ValueRef> {
            let text = args
                .first()
                .ok_or_else(|| HostError::raised("hook_read_after expects the text read"))?;
            let bytes = text.as_bytes().ok_or_else(|| text.type_error("str"))?;
            hook(bytes)
        }));
        self
    }

    /// Set the `file` object
    pub fn file(mut self, file: ValueRef) -> Self {
        self.file = Some(file);
        self
    }

    /// Read input from `reader`; sets both `read` and `file`
    pub fn input(mut self, reader: impl Read + 'static) -> Self {
        let (read, file) = input_attributes(InputSource::new(reader));
        self.read = Some(read);
        self.file = Some(file);
        self
    }

    /// Set any other attribute
    pub fn attr(mut self, name: &str, value: ValueRef) -> Self {
        self.attrs.push((name.to_string(), value));
        self
    }

    /// Build the parser object
    pub fn build(self) -> ValueRef {
        let NativeParser {
            handlers,
            observer,
            before_read,
            read,
            after_read,
            file,
            attrs,
        } = self;

        Rc::new_cyclic(move |this: &Weak<Value>| {
            let object = Object::new();

            let this = this.clone();
            object.set(
                "_handle",
                Value::callable(move |args| {
                    let result = dispatch(&handlers, args)?;
                    if let Some(parser) = this.upgrade() {
                        if let Some(object) = parser.as_object() {
                            object.set(LAST_RESULT, result.clone());
                        }
                    }
                    Ok(result)
                }),
            );

            if let Some(observer) = observer {
                object.set("hook_handler", Rc::new(Value::Callable(observer)));
            }
            if let Some(hook) = before_read {
                object.set("hook_read_before", Rc::new(Value::Callable(hook)));
            }
            if let Some(read) = read {
                object.set("read", read);
            }
            if let Some(hook) = after_read {
                object.set("hook_read_after", Rc::new(Value::Callable(hook)));
            }
            if let Some(file) = file {
                object.set("file", file);
            }
            for (name, value) in attrs {
                object.set(&name, value);
            }

            Value::Object(object)
        })
    }
}

/// `_handle(target, option, names, values)`
fn dispatch(handlers: &HashMap<String, RuleHandler>, args: &[ValueRef]) -> HostResult<ValueRef> {
    let [target, option, names, values] = args else {
        return Err(HostError::raised(format!(
            "_handle expects 4 arguments, got {}",
            args.len()
        )));
    };

    let target = target.as_str().ok_or_else(|| target.type_error("str"))?;
    let option = option.as_int().ok_or_else(|| option.type_error("int"))?;
    let names = names
        .as_list()
        .ok_or_else(|| names.type_error("list"))?
        .iter()
        .map(|name| {
            name.as_str()
                .map(str::to_string)
                .ok_or_else(|| name.type_error("str"))
        })
        .collect::<HostResult<Vec<_>>>()?;
    let values = values.as_list().ok_or_else(|| values.type_error("list"))?;

    let call = RuleCall {
        target,
        option,
        names: &names,
        values,
    };

    match handlers.get(target) {
        Some(handler) => handler(&call),
        None => Ok(Value::node(call.to_node())),
    }
}

// ============================================================================
// Runtime
// ============================================================================

static NAMES: AttributeCache<&'static str> = AttributeCache::new();

/// [`HostRuntime`] over native values
///
/// Exported values are `Rc` pointers; the runtime is single-threaded.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeRuntime;

impl NativeRuntime {
    /// Create the runtime
    pub fn new() -> Self {
        NativeRuntime
    }
}

impl HostRuntime for NativeRuntime {
    type Object = ValueRef;
    type Name = &'static str;

    fn names(&self) -> &AttributeCache<&'static str> {
        &NAMES
    }

    fn intern(&self, name: &'static str) -> HostResult<&'static str> {
        Ok(name)
    }

    fn get_attr(&self, object: &ValueRef, name: &&'static str) -> HostResult<ValueRef> {
        object.get_attr(name).ok_or_else(|| HostError::missing(*name))
    }

    fn has_attr(&self, object: &ValueRef, name: &&'static str) -> bool {
        object.as_object().is_some_and(|o| o.has(name))
    }

    fn call(&self, callable: &ValueRef, args: &[ValueRef]) -> HostResult<ValueRef> {
        match callable.as_ref() {
            Value::Callable(f) => f(args),
            other => Err(other.type_error("callable")),
        }
    }

    fn new_str(&self, value: &str) -> HostResult<ValueRef> {
        Ok(Value::str(value))
    }

    fn new_bytes(&self, value: &[u8]) -> HostResult<ValueRef> {
        Ok(Value::bytes(value))
    }

    fn new_int(&self, value: i64) -> HostResult<ValueRef> {
        Ok(Value::int(value))
    }

    fn new_list(&self, items: Vec<ValueRef>) -> HostResult<ValueRef> {
        Ok(Value::list(items))
    }

    fn text_bytes(&self, value: &ValueRef) -> HostResult<Vec<u8>> {
        value
            .as_bytes()
            .map(<[u8]>::to_vec)
            .ok_or_else(|| value.type_error("str"))
    }

    fn is_truthy(&self, value: &ValueRef) -> HostResult<bool> {
        Ok(value.is_truthy())
    }

    fn export(&self, value: ValueRef) -> RawHostRef {
        Rc::into_raw(value) as RawHostRef
    }

    unsafe fn borrow_raw(&self, raw: RawHostRef) -> ValueRef {
        let ptr = raw as *const Value;
        Rc::increment_strong_count(ptr);
        Rc::from_raw(ptr)
    }

    unsafe fn release_raw(&self, raw: RawHostRef) {
        drop(Rc::from_raw(raw as *const Value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::host::Attr;

    #[test]
    fn test_unhandled_rule_builds_node() {
        let runtime = NativeRuntime::new();
        let parser = NativeParser::new().build();

        let handle = runtime.attr(&parser, Attr::Handle).unwrap();
        let args = [
            Value::str("expr"),
            Value::int(2),
            Value::list(vec![Value::str("number")]),
            Value::list(vec![Value::int(42)]),
        ];
        let result = runtime.call(&handle, &args).unwrap();

        let node = result.as_node().unwrap();
        assert_eq!(node.target, "expr");
        assert_eq!(node.option, 2);
        assert_eq!(node.get("number").and_then(|v| v.as_int()), Some(42));
        assert!(Rc::ptr_eq(&parser.get_attr(LAST_RESULT).unwrap(), &result));
    }

    #[test]
    fn test_handle_checks_arity() {
        let runtime = NativeRuntime::new();
        let parser = NativeParser::new().build();
        let handle = runtime.attr(&parser, Attr::Handle).unwrap();
        assert!(runtime.call(&handle, &[Value::str("expr")]).is_err());
    }

    #[test]
    fn test_dump_nests_nodes() {
        let inner = ParseNode {
            target: "expr".to_string(),
            option: 0,
            names: vec!["number".to_string()],
            values: vec![Value::int(3)],
        };
        let outer = ParseNode {
            target: "expr_plus".to_string(),
            option: 1,
            names: vec!["left".to_string(), "right".to_string()],
            values: vec![Value::node(inner), Value::int(4)],
        };

        assert_eq!(
            outer.dump(),
            "expr_plus (1)\n  left: expr (0)\n    number: 3\n  right: 4\n"
        );
    }

    #[test]
    fn test_serialize_skips_callables() {
        let object = Value::object(vec![
            ("name", Value::str("calc")),
            ("run", Value::callable(|_| Ok(Value::nil()))),
            ("sizes", Value::list(vec![Value::int(1), Value::bool(true)])),
        ]);
        let json = serde_json::to_string(object.as_ref()).unwrap();
        assert_eq!(json, r#"{"name":"calc","sizes":[1,true]}"#);
    }

    #[test]
    fn test_input_source_reads_lines() {
        let mut source = InputSource::new("one\ntwo\nthree".as_bytes());
        assert_eq!(source.read_chunk(64).unwrap(), b"one\n");
        assert_eq!(source.read_chunk(64).unwrap(), b"two\n");
        assert_eq!(source.read_chunk(64).unwrap(), b"three");
        assert!(source.read_chunk(64).unwrap().is_empty());
    }

    #[test]
    fn test_input_source_respects_max() {
        let mut source = InputSource::new("abcdefgh\n".as_bytes());
        assert_eq!(source.read_chunk(3).unwrap(), b"abc");
        assert_eq!(source.read_chunk(3).unwrap(), b"def");
        assert_eq!(source.read_chunk(64).unwrap(), b"gh\n");
    }

    #[test]
    fn test_input_source_cuts_at_byte_boundaries() {
        let mut source = InputSource::new("é".as_bytes());
        assert_eq!(source.read_chunk(1).unwrap(), vec![0xC3]);
        assert_eq!(source.read_chunk(1).unwrap(), vec![0xA9]);
        assert!(source.read_chunk(1).unwrap().is_empty());
    }

    #[test]
    fn test_read_returns_raw_bytes() {
        let runtime = NativeRuntime::new();
        let parser = NativeParser::new().input(&b"caf\xe9\n"[..]).build();

        let read = runtime.attr(&parser, Attr::Read).unwrap();
        let chunk = runtime.call(&read, &[Value::int(64)]).unwrap();
        assert_eq!(runtime.text_bytes(&chunk).unwrap(), b"caf\xe9\n");
        assert_eq!(chunk.as_str(), None);
    }

    #[test]
    fn test_utf8_bytes_read_as_text() {
        let value = Value::bytes("42".as_bytes());
        assert_eq!(value.as_str(), Some("42"));
        assert_eq!(value.as_bytes(), Some(&b"42"[..]));
        assert_eq!(serde_json::to_string(value.as_ref()).unwrap(), r#""42""#);
    }

    #[test]
    fn test_node_json_round_trip() {
        let inner = ParseNode {
            target: "expr".to_string(),
            option: 0,
            names: vec!["number".to_string()],
            values: vec![Value::str("3")],
        };
        let outer = ParseNode {
            target: "expr_plus".to_string(),
            option: 1,
            names: vec!["left".to_string(), "right".to_string(), "extra".to_string()],
            values: vec![
                Value::node(inner),
                Value::int(-4),
                Value::list(vec![Value::nil(), Value::bool(true)]),
            ],
        };

        let json = serde_json::to_string(&outer).unwrap();
        let loaded = ParseNode::from_json(&json).unwrap();

        assert_eq!(loaded.dump(), outer.dump());
        assert_eq!(serde_json::to_string(&loaded).unwrap(), json);
        let left = loaded.get("left").and_then(|v| v.as_node()).unwrap();
        assert_eq!(left.get("number").and_then(|v| v.as_str()), Some("3"));
    }

    #[test]
    fn test_node_json_rejects_other_values() {
        assert!(ParseNode::from_json("[1, 2]").is_err());
        assert!(ParseNode::from_json(r#"{"target": "expr", "option": 0, "args": [[1, 2]]}"#).is_err());

        let object: Value = serde_json::from_str(r#"{"name": "calc", "size": 3}"#).unwrap();
        let object = object.as_object().unwrap();
        assert_eq!(object.names(), vec!["name", "size"]);
        assert_eq!(object.get("size").and_then(|v| v.as_int()), Some(3));
    }

    #[test]
    fn test_file_close_marks_closed() {
        let runtime = NativeRuntime::new();
        let parser = NativeParser::new().input("1\n".as_bytes()).build();

        let file = runtime.attr(&parser, Attr::File).unwrap();
        let closed = runtime.attr(&file, Attr::Closed).unwrap();
        assert!(!runtime.is_truthy(&closed).unwrap());

        let close = runtime.attr(&file, Attr::Close).unwrap();
        runtime.call(&close, &[]).unwrap();

        let closed = runtime.attr(&file, Attr::Closed).unwrap();
        assert!(runtime.is_truthy(&closed).unwrap());

        let read = runtime.attr(&parser, Attr::Read).unwrap();
        let text = runtime.call(&read, &[Value::int(16)]).unwrap();
        assert_eq!(text.as_bytes(), Some(&b""[..]));
    }

    #[test]
    fn test_raw_handles_keep_values_alive() {
        let runtime = NativeRuntime::new();
        let value = Value::int(5);
        let raw = runtime.export(value.clone());
        assert_eq!(Rc::strong_count(&value), 2);

        let borrowed = unsafe { runtime.borrow_raw(raw) };
        assert_eq!(Rc::strong_count(&value), 3);
        drop(borrowed);

        unsafe { runtime.release_raw(raw) };
        assert_eq!(Rc::strong_count(&value), 1);
    }

    #[test]
    fn test_call_non_callable() {
        let runtime = NativeRuntime::new();
        let err = runtime.call(&Value::int(1), &[]).unwrap_err();
        assert_eq!(
            err,
            HostError::TypeMismatch {
                expected: "callable".to_string(),
                actual: "int".to_string()
            }
        );
    }
}
