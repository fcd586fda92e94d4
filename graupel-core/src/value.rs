//! Working with Graupel values.

use {std::{fmt, ptr::NonNull}, thiserror::Error};

/// Number of low bits available for a tagged payload.
const NUM_DATA_BITS: u32 = 48;

/// Mask selecting the payload bits of a tagged value.
const DATA_MASK: u64 = (1 << NUM_DATA_BITS) - 1;

/// The bit pattern NaNs are canonicalized to before storage.
///
/// This is the quiet NaN with a zero payload and a clear sign bit.
/// Its top sixteen bits are below every tag, so canonicalized
/// numbers can never be mistaken for tagged values.
const CANONICAL_NAN: u64 = 0x7FF8_0000_0000_0000;

/// The different possible tags of a non-number value.
///
/// A value is 64 bits wide. Numbers are stored as their IEEE-754 bit
/// pattern, with NaNs canonicalized to [`CANONICAL_NAN`]. Everything
/// else is stored as a 16-bit tag in the top bits and a 48-bit payload
/// in the low bits. The largest top-sixteen-bit pattern a canonical
/// double can produce is `0xFFF0` (negative infinity), so every tag
/// lies strictly above it. For each tag we document the structure of
/// the associated payload.
mod tag
{
    // NOTE: Tags must be greater than 0xFFF0.

    /// The value is undefined.
    ///
    /// The payload is 0.
    pub const UNDEFINED: u16 = 0xFFF1;

    /// The value is null.
    ///
    /// The payload is 0.
    pub const NULL: u16 = 0xFFF2;

    /// The value is a Boolean.
    ///
    /// The payload is 1 for true, 0 for false.
    pub const BOOLEAN: u16 = 0xFFF3;

    /// The value is a raw native pointer.
    ///
    /// The payload is the pointer's address, which must fit in 48 bits.
    /// The garbage collector does not look through these; they carry
    /// bookkeeping data for the runtime itself, such as free-list links.
    pub const NATIVE: u16 = 0xFFF4;

    /// The value is a pointer to an object owned by the heap.
    ///
    /// The payload is the object's address, which must fit in 48 bits
    /// and must not be null. Cells with this tag are traced by the
    /// garbage collector.
    pub const OBJECT: u16 = 0xFFF5;

    /// The smallest tag. Anything below this is a number.
    pub const FIRST: u16 = UNDEFINED;
}

/// Dynamically-typed Graupel value.
///
/// A [`Value`] fits in one machine word and can represent any runtime
/// value. Numbers are stored directly; all other types are stored as a
/// tagged payload in the NaN space (see [`tag`]). Values are plain
/// bits: they are freely copied, and equality is bit identity.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Value
{
    inner: u64,
}

/// The type of a [`Value`], as determined by its tag.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValueType
{
    Number,
    Undefined,
    Null,
    Boolean,
    NativePointer,
    Object,
}

/// Returned when decoding a [`Value`] with the wrong tag.
#[derive(Debug, Error, Eq, PartialEq)]
#[error("Value is of type {actual:?}, expected {expected:?}")]
pub struct TypeError
{
    /// The type the caller asked for.
    pub expected: ValueType,

    /// The type the value actually has.
    pub actual: ValueType,
}

impl Value
{
    /// Create a value from a tag and a payload.
    fn new_tagged(tag: u16, payload: u64) -> Self
    {
        debug_assert!(tag >= tag::FIRST, "Tag collides with the number space");
        debug_assert!(payload <= DATA_MASK, "Payload does not fit in 48 bits");
        Self{inner: (tag as u64) << NUM_DATA_BITS | payload}
    }

    /// The undefined value.
    pub fn undefined() -> Self
    {
        Self::new_tagged(tag::UNDEFINED, 0)
    }

    /// The null value.
    pub fn null() -> Self
    {
        Self::new_tagged(tag::NULL, 0)
    }

    /// Create a Boolean value.
    pub fn boolean(b: bool) -> Self
    {
        Self::new_tagged(tag::BOOLEAN, b as u64)
    }

    /// Create a number value.
    ///
    /// NaNs are canonicalized, so the stored bit pattern may differ
    /// from that of `n`. The numeric value is always preserved.
    pub fn number(n: f64) -> Self
    {
        if n.is_nan() {
            Self{inner: CANONICAL_NAN}
        } else {
            Self{inner: n.to_bits()}
        }
    }

    /// Create a value carrying a raw native pointer.
    ///
    /// The pointer may be null. The address must fit in 48 bits,
    /// which holds for all user-space pointers on supported targets.
    pub fn native_pointer<T>(ptr: *mut T) -> Self
    {
        let addr = ptr as usize as u64;
        Self::new_tagged(tag::NATIVE, addr)
    }

    /// Create a value referencing a heap object.
    pub fn object(ptr: NonNull<()>) -> Self
    {
        let addr = ptr.as_ptr() as usize as u64;
        Self::new_tagged(tag::OBJECT, addr)
    }

    /// The top sixteen bits, which identify non-number values.
    fn raw_tag(self) -> u16
    {
        (self.inner >> NUM_DATA_BITS) as u16
    }

    /// The payload bits of a tagged value.
    fn payload(self) -> u64
    {
        self.inner & DATA_MASK
    }

    /// The type of this value.
    pub fn value_type(self) -> ValueType
    {
        match self.raw_tag() {
            tag::UNDEFINED => ValueType::Undefined,
            tag::NULL      => ValueType::Null,
            tag::BOOLEAN   => ValueType::Boolean,
            tag::NATIVE    => ValueType::NativePointer,
            tag::OBJECT    => ValueType::Object,
            _              => ValueType::Number,
        }
    }

    /// Whether this value is a number.
    pub fn is_number(self) -> bool
    {
        self.raw_tag() < tag::FIRST
    }

    /// Whether this value is undefined.
    pub fn is_undefined(self) -> bool
    {
        self.raw_tag() == tag::UNDEFINED
    }

    /// Whether this value is null.
    pub fn is_null(self) -> bool
    {
        self.raw_tag() == tag::NULL
    }

    /// Whether this value is a Boolean.
    pub fn is_boolean(self) -> bool
    {
        self.raw_tag() == tag::BOOLEAN
    }

    /// Whether this value carries a raw native pointer.
    pub fn is_native_pointer(self) -> bool
    {
        self.raw_tag() == tag::NATIVE
    }

    /// Whether this value references a heap object.
    pub fn is_object(self) -> bool
    {
        self.raw_tag() == tag::OBJECT
    }

    /// The number this value stores.
    ///
    /// Must only be called on numbers.
    pub fn as_number(self) -> f64
    {
        debug_assert!(self.is_number(), "Value is not a number");
        f64::from_bits(self.inner)
    }

    /// The Boolean this value stores.
    ///
    /// Must only be called on Booleans.
    pub fn as_boolean(self) -> bool
    {
        debug_assert!(self.is_boolean(), "Value is not a Boolean");
        self.payload() != 0
    }

    /// The native pointer this value stores.
    ///
    /// Must only be called on native pointers.
    /// Round-trips the pointer given to [`native_pointer`][`Self::native_pointer`].
    pub fn as_native_pointer<T>(self) -> *mut T
    {
        debug_assert!(self.is_native_pointer(), "Value is not a native pointer");
        self.payload() as usize as *mut T
    }

    /// The object reference this value stores.
    ///
    /// Must only be called on object values.
    pub fn as_object(self) -> NonNull<()>
    {
        debug_assert!(self.is_object(), "Value is not an object");
        let ptr = self.payload() as usize as *mut ();
        NonNull::new(ptr).expect("Object payload must not be null")
    }
}

impl fmt::Debug for Value
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        match self.value_type() {
            ValueType::Number        => write!(f, "Value({})", self.as_number()),
            ValueType::Undefined     => write!(f, "Value(undefined)"),
            ValueType::Null          => write!(f, "Value(null)"),
            ValueType::Boolean       => write!(f, "Value({})", self.as_boolean()),
            ValueType::NativePointer => write!(f, "Value({:#014x})", self.payload()),
            ValueType::Object        => write!(f, "Value(*{:#014x})", self.payload()),
        }
    }
}

/// Rust types with a [`Value`] representation.
///
/// This is the typed facade over the uniform tagged cell: handles and
/// the allocator are generic over it, so callers work with `bool` or
/// `f64` directly while storage remains a plain [`Value`].
pub trait ValueRepr: Copy
{
    /// Encode this into a value.
    fn encode(self) -> Value;

    /// Decode a value, checking its tag.
    fn try_decode(value: Value) -> Result<Self, TypeError>;

    /// Decode a value whose tag is known to match.
    ///
    /// # Panics
    ///
    /// Panics if the value has the wrong tag.
    /// Use [`try_decode`][`Self::try_decode`] to recover instead.
    fn decode(value: Value) -> Self
    {
        match Self::try_decode(value) {
            Ok(this) => this,
            Err(err) => panic!("{err}"),
        }
    }
}

impl ValueRepr for Value
{
    fn encode(self) -> Value
    {
        self
    }

    fn try_decode(value: Value) -> Result<Self, TypeError>
    {
        Ok(value)
    }
}

impl ValueRepr for bool
{
    fn encode(self) -> Value
    {
        Value::boolean(self)
    }

    fn try_decode(value: Value) -> Result<Self, TypeError>
    {
        match value.value_type() {
            ValueType::Boolean => Ok(value.as_boolean()),
            actual => Err(TypeError{expected: ValueType::Boolean, actual}),
        }
    }
}

impl ValueRepr for f64
{
    fn encode(self) -> Value
    {
        Value::number(self)
    }

    fn try_decode(value: Value) -> Result<Self, TypeError>
    {
        match value.value_type() {
            ValueType::Number => Ok(value.as_number()),
            actual => Err(TypeError{expected: ValueType::Number, actual}),
        }
    }
}
