//! # Field cache
//!
//! A `FieldCache` is one evaluation context: it binds the current location (a point in a mesh
//! element, a node or an explicit point), the parameter vector parameter derivatives are
//! taken with respect to, and the per-field value caches memoizing everything evaluated
//! there. One cache is used by one thread; independent caches of the same field module may
//! be used from different threads.
//!
//! Changing the location or the parameters bumps the cache's validity token, which makes
//! every stored value stale at once. Assignments to fields arrive as invalidation messages
//! from the field module and are applied before the next evaluation.
use crate::computed_field::errors::FieldError;
use crate::computed_field::field_module::FieldId;
use crate::computed_field::value_cache::{CacheState, RealFieldValueCache};
use log::debug;
use nalgebra::DVector;
use std::collections::{HashMap, HashSet};
use std::sync::mpsc::Receiver;

/// Identifier of a mesh element owned by the mesh layer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(pub usize);

/// Identifier of a node owned by the mesh layer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

#[derive(Clone, Debug, PartialEq)]
pub struct MeshLocation {
    pub element: ElementId,
    /// element chart coordinates, one per element dimension
    pub xi: DVector<f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Location {
    Mesh(MeshLocation),
    Node(NodeId),
    /// explicit point in a field's value space, not tied to any mesh entity
    Point(DVector<f64>),
}

/// What leaf fields see of a cache: where to evaluate and with which parameters
#[derive(Clone, Copy, Debug)]
pub struct EvaluationPoint<'a> {
    pub location: &'a Location,
    pub parameters: &'a DVector<f64>,
}

impl<'a> EvaluationPoint<'a> {
    pub fn mesh_location(&self) -> Option<&'a MeshLocation> {
        match self.location {
            Location::Mesh(mesh_location) => Some(mesh_location),
            _ => None,
        }
    }

    pub fn xi(&self) -> Option<&'a DVector<f64>> {
        self.mesh_location().map(|mesh_location| &mesh_location.xi)
    }

    pub fn node(&self) -> Option<NodeId> {
        match self.location {
            Location::Node(node) => Some(*node),
            _ => None,
        }
    }
}

/// Message from the field module to its caches
#[derive(Clone, Debug)]
pub(crate) enum CacheMessage {
    /// values of these fields changed
    Invalidate(Vec<FieldId>),
    /// the field was removed; its handle will never be valid again
    Remove(FieldId),
}

pub struct FieldCache {
    module_id: u32,
    location: Option<Location>,
    parameters: DVector<f64>,
    token: u64,
    value_caches: HashMap<FieldId, RealFieldValueCache>,
    invalidations: Option<Receiver<CacheMessage>>,
    // scratch cache for evaluating at perturbed locations
    extra_cache: Option<Box<FieldCache>>,
}

impl FieldCache {
    pub(crate) fn new(module_id: u32, invalidations: Option<Receiver<CacheMessage>>) -> Self {
        FieldCache {
            module_id,
            location: None,
            parameters: DVector::zeros(0),
            token: 1,
            value_caches: HashMap::new(),
            invalidations,
            extra_cache: None,
        }
    }

    pub(crate) fn module_id(&self) -> u32 {
        self.module_id
    }

    ////////////////////////////SETTERS///////////////////////////////////////////////////////////////////
    pub fn set_mesh_location(&mut self, element: ElementId, xi: &[f64]) {
        self.set_location(Location::Mesh(MeshLocation {
            element,
            xi: DVector::from_column_slice(xi),
        }));
    }

    pub fn set_node(&mut self, node: NodeId) {
        self.set_location(Location::Node(node));
    }

    pub fn set_point(&mut self, coordinates: &[f64]) {
        self.set_location(Location::Point(DVector::from_column_slice(coordinates)));
    }

    pub fn set_location(&mut self, location: Location) {
        self.location = Some(location);
        self.bump_token();
    }

    pub fn clear_location(&mut self) {
        self.location = None;
        self.bump_token();
    }

    /// Set the parameters that parameter derivatives are taken with respect to
    pub fn set_parameters(&mut self, parameters: &[f64]) {
        self.parameters = DVector::from_column_slice(parameters);
        self.bump_token();
    }

    pub(crate) fn set_state(&mut self, location: Location, parameters: DVector<f64>) {
        self.location = Some(location);
        self.parameters = parameters;
        self.bump_token();
    }

    fn bump_token(&mut self) {
        self.token += 1;
    }

    ////////////////////////////GETTERS///////////////////////////////////////////////////////////////////
    pub fn location(&self) -> Option<&Location> {
        self.location.as_ref()
    }

    pub fn parameters(&self) -> &DVector<f64> {
        &self.parameters
    }

    pub fn evaluation_point(&self) -> Result<EvaluationPoint<'_>, FieldError> {
        let location = self.location.as_ref().ok_or(FieldError::LocationNotSet)?;
        Ok(EvaluationPoint {
            location,
            parameters: &self.parameters,
        })
    }

    /// Lifecycle state of the value cache of `field` at the current location
    pub fn value_cache_state(&self, field: FieldId) -> CacheState {
        self.value_caches
            .get(&field)
            .map(|value_cache| value_cache.state_at(self.token))
            .unwrap_or(CacheState::Unevaluated)
    }

    /// Value cache of `field`, brought up to date with the current location
    pub(crate) fn value_cache(&mut self, field: FieldId) -> &mut RealFieldValueCache {
        let token = self.token;
        let value_cache = self.value_caches.entry(field).or_default();
        value_cache.refresh(token);
        value_cache
    }

    /// Apply pending invalidation messages from the field module
    pub(crate) fn process_invalidations(&mut self) {
        let Some(receiver) = self.invalidations.as_ref() else {
            return;
        };
        let messages: Vec<CacheMessage> = receiver.try_iter().collect();
        let mut invalidated = HashSet::new();
        for message in messages {
            match message {
                CacheMessage::Invalidate(fields) => invalidated.extend(fields),
                CacheMessage::Remove(field) => {
                    invalidated.remove(&field);
                    self.drop_field(field);
                }
            }
        }
        self.invalidate_fields(&invalidated);
    }

    /// Mark the value caches of `fields` stale
    pub(crate) fn invalidate_fields(&mut self, fields: &HashSet<FieldId>) {
        let mut invalidated = 0;
        for field in fields {
            if let Some(value_cache) = self.value_caches.get_mut(field) {
                value_cache.invalidate();
                invalidated += 1;
            }
        }
        if invalidated > 0 {
            debug!("field cache invalidated {} value caches", invalidated);
        }
    }

    fn drop_field(&mut self, field: FieldId) {
        self.value_caches.remove(&field);
        if let Some(extra) = self.extra_cache.as_mut() {
            extra.drop_field(field);
        }
    }

    /// Number of fields with storage in this cache
    pub(crate) fn number_of_value_caches(&self) -> usize {
        self.value_caches.len()
    }

    /// Scratch cache at this cache's location, for evaluations at perturbed locations.
    /// Return it with `restore_extra_cache` when done.
    pub(crate) fn take_extra_cache(&mut self) -> Box<FieldCache> {
        let mut extra = self
            .extra_cache
            .take()
            .unwrap_or_else(|| Box::new(FieldCache::new(self.module_id, None)));
        if let Some(location) = self.location.clone() {
            extra.set_state(location, self.parameters.clone());
        }
        extra
    }

    pub(crate) fn restore_extra_cache(&mut self, extra: Box<FieldCache>) {
        self.extra_cache = Some(extra);
    }
}
