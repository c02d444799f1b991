use crate::hashing::stable_hash;
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

/// A loaded object with its concrete type erased. Every operation result is stored this way and
/// downcast back to the requested type at the handle.
pub type ErasedObject = Arc<dyn Any + Send + Sync>;

/// How a requested result is shaped. Providers that can return several sub-objects for one location
/// use this to decide between returning the main object or all of them.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ResultShape {
    /// A single `Arc<T>`
    Single,
    /// `Box<[Arc<T>]>`
    Array,
    /// `Vec<Arc<T>>`
    List,
}

/// The type a caller asked an operation to produce. Built at the call site from a concrete `T`, so
/// no runtime reflection is needed to turn provider output into the shape the caller wants.
#[derive(Copy, Clone)]
pub struct ResultType {
    element: TypeId,
    output: TypeId,
    element_name: &'static str,
    shape: ResultShape,
    collect: fn(Vec<ErasedObject>) -> Option<ErasedObject>,
}

fn collect_single(items: Vec<ErasedObject>) -> Option<ErasedObject> {
    items.into_iter().next()
}

fn collect_list<T: Any + Send + Sync>(items: Vec<ErasedObject>) -> Option<ErasedObject> {
    let mut typed = Vec::with_capacity(items.len());
    for item in items {
        typed.push(item.downcast::<T>().ok()?);
    }

    Some(Arc::new(typed))
}

fn collect_array<T: Any + Send + Sync>(items: Vec<ErasedObject>) -> Option<ErasedObject> {
    let mut typed = Vec::with_capacity(items.len());
    for item in items {
        typed.push(item.downcast::<T>().ok()?);
    }

    Some(Arc::new(typed.into_boxed_slice()))
}

impl ResultType {
    pub fn single<T: Any + Send + Sync>() -> Self {
        ResultType {
            element: TypeId::of::<T>(),
            output: TypeId::of::<T>(),
            element_name: std::any::type_name::<T>(),
            shape: ResultShape::Single,
            collect: collect_single,
        }
    }

    pub fn array<T: Any + Send + Sync>() -> Self {
        ResultType {
            element: TypeId::of::<T>(),
            output: TypeId::of::<Box<[Arc<T>]>>(),
            element_name: std::any::type_name::<T>(),
            shape: ResultShape::Array,
            collect: collect_array::<T>,
        }
    }

    pub fn list<T: Any + Send + Sync>() -> Self {
        ResultType {
            element: TypeId::of::<T>(),
            output: TypeId::of::<Vec<Arc<T>>>(),
            element_name: std::any::type_name::<T>(),
            shape: ResultShape::List,
            collect: collect_list::<T>,
        }
    }

    pub fn shape(&self) -> ResultShape {
        self.shape
    }

    /// Type id of `T` regardless of shape
    pub fn element_type_id(&self) -> TypeId {
        self.element
    }

    /// Type id of the value stored as the operation result
    pub fn output_type_id(&self) -> TypeId {
        self.output
    }

    pub fn element_name(&self) -> &'static str {
        self.element_name
    }

    /// True if `value` can be stored as the result of an operation of this type
    pub fn matches(
        &self,
        value: &ErasedObject,
    ) -> bool {
        Any::type_id(&**value) == self.output
    }

    pub fn is_element(
        &self,
        value: &ErasedObject,
    ) -> bool {
        Any::type_id(&**value) == self.element
    }

    /// Builds the stored result from individually loaded objects. Returns None if any of them is
    /// not a `T`.
    pub fn collect(
        &self,
        items: Vec<ErasedObject>,
    ) -> Option<ErasedObject> {
        (self.collect)(items)
    }

    pub fn type_hash(&self) -> u64 {
        stable_hash(&(self.output, self.shape))
    }
}

impl PartialEq for ResultType {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        self.output == other.output
    }
}

impl Eq for ResultType {}

impl std::hash::Hash for ResultType {
    fn hash<H: std::hash::Hasher>(
        &self,
        state: &mut H,
    ) {
        self.output.hash(state)
    }
}

impl fmt::Debug for ResultType {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self.shape {
            ResultShape::Single => write!(f, "{}", self.element_name),
            ResultShape::Array => write!(f, "[{}]", self.element_name),
            ResultShape::List => write!(f, "Vec<{}>", self.element_name),
        }
    }
}
