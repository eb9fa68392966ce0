use crate::OperationError;
use serde::{Serialize, Serializer};
use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};

/// A value produced or consumed by graph nodes.
///
/// Implemented for every `Clone + Debug + Send + Sync + 'static` type; the
/// clone backs the defensive snapshots handed to shared consumers.
pub trait Artifact: Any + Send + Sync + fmt::Debug {
    /// Deep copy used for snapshots.
    fn duplicate(&self) -> Box<dyn Artifact>;

    fn artifact_type(&self) -> ArtifactType;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T> Artifact for T
where
    T: Any + Clone + Send + Sync + fmt::Debug,
{
    fn duplicate(&self) -> Box<dyn Artifact> {
        Box::new(self.clone())
    }

    fn artifact_type(&self) -> ArtifactType {
        ArtifactType::of::<T>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Runtime type tag of an artifact, used to type-check bindings before
/// anything is scheduled.
#[derive(Clone, Copy)]
pub struct ArtifactType {
    id: TypeId,
    name: &'static str,
}

impl ArtifactType {
    pub fn of<T: Any>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn is<T: Any>(&self) -> bool {
        self.id == TypeId::of::<T>()
    }

    /// Fully qualified type name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Type name without its module path.
    pub fn short_name(&self) -> &'static str {
        let base = self.name.split('<').next().unwrap_or(self.name);
        match base.rfind("::") {
            Some(pos) if !self.name.contains('<') => &self.name[pos + 2..],
            _ => self.name,
        }
    }
}

impl PartialEq for ArtifactType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ArtifactType {}

impl Hash for ArtifactType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

impl Serialize for ArtifactType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name)
    }
}

/// The live, mutable artifact held in a node's result slot.
///
/// Cloning the cell clones the reference: every clone sees the same value.
/// Exclusive consumers receive the producer's cell itself, so a method node
/// mutating its receiver is visible through the producer's result.
#[derive(Clone)]
pub struct ArtifactCell {
    ty: ArtifactType,
    inner: Arc<RwLock<Box<dyn Artifact>>>,
}

impl ArtifactCell {
    pub fn new<T: Artifact>(value: T) -> Self {
        let boxed: Box<dyn Artifact> = Box::new(value);
        Self {
            ty: ArtifactType::of::<T>(),
            inner: Arc::new(RwLock::new(boxed)),
        }
    }

    pub fn from_boxed(value: Box<dyn Artifact>) -> Self {
        Self {
            ty: Artifact::artifact_type(&*value),
            inner: Arc::new(RwLock::new(value)),
        }
    }

    pub fn artifact_type(&self) -> ArtifactType {
        self.ty
    }

    /// Runs `f` with shared access to the artifact.
    pub fn read<T: Any, R>(&self, f: impl FnOnce(&T) -> R) -> Result<R, OperationError> {
        let guard = self.inner.read().map_err(|_| poisoned(self.ty))?;
        let value = Artifact::as_any(&**guard)
            .downcast_ref::<T>()
            .ok_or_else(|| mismatch::<T>(self.ty))?;
        Ok(f(value))
    }

    /// Runs `f` with mutable access to the artifact.
    pub fn write<T: Any, R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, OperationError> {
        let mut guard = self.inner.write().map_err(|_| poisoned(self.ty))?;
        let value = Artifact::as_any_mut(&mut **guard)
            .downcast_mut::<T>()
            .ok_or_else(|| mismatch::<T>(self.ty))?;
        Ok(f(value))
    }

    /// Clones the current value out of the cell.
    pub fn get<T: Any + Clone>(&self) -> Result<T, OperationError> {
        self.read(|value: &T| value.clone())
    }

    /// Takes a deep copy of the current value. Later writes through this
    /// cell do not affect the snapshot.
    pub fn snapshot(&self) -> Result<Snapshot, OperationError> {
        let guard = self.inner.read().map_err(|_| poisoned(self.ty))?;
        let copy: Box<dyn Artifact> = Artifact::duplicate(&**guard);
        Ok(Snapshot(Arc::from(copy)))
    }

    /// True when both cells refer to the same artifact.
    pub fn ptr_eq(&self, other: &ArtifactCell) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for ArtifactCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_read() {
            Ok(guard) => f.debug_tuple("ArtifactCell").field(&&**guard).finish(),
            Err(_) => write!(f, "ArtifactCell(<{} locked>)", self.ty),
        }
    }
}

/// Read-only copy of an artifact handed to shared consumers.
///
/// Only shared references to the inner value are ever exposed.
#[derive(Clone)]
pub struct Snapshot(Arc<dyn Artifact>);

impl Snapshot {
    pub fn new<T: Artifact>(value: T) -> Self {
        Snapshot(Arc::new(value))
    }

    pub fn artifact_type(&self) -> ArtifactType {
        Artifact::artifact_type(&*self.0)
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        Artifact::as_any(&*self.0).downcast_ref::<T>()
    }

    pub fn ptr_eq(&self, other: &Snapshot) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Snapshot").field(&&*self.0).finish()
    }
}

fn poisoned(ty: ArtifactType) -> OperationError {
    OperationError::Failed(format!("{} artifact lock poisoned by a panicking writer", ty))
}

fn mismatch<T: Any>(actual: ArtifactType) -> OperationError {
    OperationError::InvalidArgumentType {
        field: "artifact".to_string(),
        expected: std::any::type_name::<T>().to_string(),
        actual: actual.name().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Grid(Vec<u8>);

    #[test]
    fn test_cell_clones_share_the_artifact() {
        let cell = ArtifactCell::new(Grid(vec![1, 2]));
        let alias = cell.clone();
        alias.write(|g: &mut Grid| g.0.push(3)).unwrap();
        assert_eq!(cell.get::<Grid>().unwrap(), Grid(vec![1, 2, 3]));
        assert!(cell.ptr_eq(&alias));
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_writes() {
        let cell = ArtifactCell::new(Grid(vec![1]));
        let snapshot = cell.snapshot().unwrap();
        cell.write(|g: &mut Grid| g.0[0] = 9).unwrap();
        assert_eq!(snapshot.downcast_ref::<Grid>(), Some(&Grid(vec![1])));
        assert_eq!(snapshot.artifact_type(), ArtifactType::of::<Grid>());
    }

    #[test]
    fn test_wrong_type_is_reported() {
        let cell = ArtifactCell::new(Grid(vec![]));
        let err = cell.read(|_: &String| ()).unwrap_err();
        assert!(matches!(err, OperationError::InvalidArgumentType { .. }));
    }

    #[test]
    fn test_boxed_cell_keeps_concrete_type() {
        let boxed: Box<dyn Artifact> = Box::new(Grid(vec![4]));
        let cell = ArtifactCell::from_boxed(boxed);
        assert!(cell.artifact_type().is::<Grid>());
        assert_eq!(cell.artifact_type().short_name(), "Grid");
    }
}
