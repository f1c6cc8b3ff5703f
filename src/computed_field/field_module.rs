//! # Field module
//!
//! Arena owning every field of a model. Fields are addressed by `FieldId`, a generation
//! checked index: removing a field bumps the generation of its slot so old handles fail
//! with `StaleField` instead of silently reaching a new field.
//!
//! The module dispatches evaluation, derivative evaluation and assignment to the field
//! cores, memoizing results in the caller's `FieldCache`. Evaluation only needs `&self`,
//! so one module can be shared by threads each holding their own cache.
//!
//! ## Change manager
//! Assignments and redefinitions report the changed field to the module. Inside a
//! `begin_change` / `end_change` bracket the changes are collected; at the outermost
//! `end_change` (or at once outside a bracket) the transitive closure of dependents is
//! computed and sent as one invalidation message to every live cache of the module.
use crate::Utils::settings::EvaluationSettings;
use crate::computed_field::errors::FieldError;
use crate::computed_field::field_cache::{CacheMessage, FieldCache, Location};
use crate::computed_field::field_commands::FieldTypeRegistry;
use crate::computed_field::field_core::{
    ComputedFieldCore, FieldContext, FieldCore, FieldDefinition, FieldKind,
};
use crate::computed_field::field_derivative::FieldDerivative;
use crate::computed_field::source_fields::{Constant, External, FieldProvider};
use crate::computed_field::value_cache::DerivativeValueCache;
use crate::computed_field::vector_operators::{
    CrossProduct, CubicTextureCoordinates, DotProduct, Magnitude, Normalise, SumComponents,
};
use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{Sender, channel};
use std::sync::{Arc, Mutex};

static NEXT_MODULE_ID: AtomicU32 = AtomicU32::new(1);

/// Handle of a field in a `FieldModule`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldId {
    module: u32,
    index: u32,
    generation: u32,
}

impl FieldId {
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

#[derive(Debug)]
struct FieldEntry {
    name: String,
    core: FieldCore,
    source_fields: Vec<FieldId>,
    number_of_components: usize,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    entry: Option<FieldEntry>,
}

#[derive(Debug, Default)]
struct ChangeState {
    level: usize,
    pending: HashSet<FieldId>,
}

pub struct FieldModule {
    id: u32,
    slots: Vec<Slot>,
    free_slots: Vec<u32>,
    names: HashMap<String, FieldId>,
    name_counter: usize,
    registry: FieldTypeRegistry,
    settings: EvaluationSettings,
    change_state: Mutex<ChangeState>,
    subscribers: Mutex<Vec<Sender<CacheMessage>>>,
    // tree orders depend only on definitions; cleared on redefinition
    tree_orders: Mutex<HashMap<(FieldId, FieldDerivative), usize>>,
}

/// Ends the change bracket opened by `FieldModule::change_guard` when dropped
pub struct ChangeGuard<'a> {
    module: &'a FieldModule,
}

impl Drop for ChangeGuard<'_> {
    fn drop(&mut self) {
        self.module.end_change();
    }
}

impl Default for FieldModule {
    fn default() -> Self {
        Self::new()
    }
}

impl FieldModule {
    pub fn new() -> Self {
        FieldModule {
            id: NEXT_MODULE_ID.fetch_add(1, Ordering::Relaxed),
            slots: Vec::new(),
            free_slots: Vec::new(),
            names: HashMap::new(),
            name_counter: 0,
            registry: FieldTypeRegistry::new(),
            settings: EvaluationSettings::default(),
            change_state: Mutex::new(ChangeState::default()),
            subscribers: Mutex::new(Vec::new()),
            tree_orders: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_settings(mut self, settings: EvaluationSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_registry(mut self, registry: FieldTypeRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn settings(&self) -> &EvaluationSettings {
        &self.settings
    }

    /// Replace the settings; every cached value of the module is invalidated since step
    /// size and zero-magnitude policy change results
    pub fn set_settings(&mut self, settings: EvaluationSettings) {
        self.settings = settings;
        let all: Vec<FieldId> = self.fields();
        self.broadcast(all);
    }

    pub fn registry(&self) -> &FieldTypeRegistry {
        &self.registry
    }

    /// New evaluation context subscribed to this module's invalidation messages
    pub fn create_field_cache(&self) -> FieldCache {
        let (sender, receiver) = channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(sender);
        FieldCache::new(self.id, Some(receiver))
    }

    ////////////////////////////////////////////////////////////////
    //  HANDLES
    ////////////////////////////////////////////////////////////////
    fn entry(&self, field: FieldId) -> Result<&FieldEntry, FieldError> {
        if field.module != self.id {
            return Err(FieldError::ForeignField);
        }
        self.slots
            .get(field.index as usize)
            .filter(|slot| slot.generation == field.generation)
            .and_then(|slot| slot.entry.as_ref())
            .ok_or(FieldError::StaleField)
    }

    fn entry_mut(&mut self, field: FieldId) -> Result<&mut FieldEntry, FieldError> {
        if field.module != self.id {
            return Err(FieldError::ForeignField);
        }
        self.slots
            .get_mut(field.index as usize)
            .filter(|slot| slot.generation == field.generation)
            .and_then(|slot| slot.entry.as_mut())
            .ok_or(FieldError::StaleField)
    }

    fn context<'a>(&'a self, field: FieldId, entry: &'a FieldEntry) -> FieldContext<'a> {
        FieldContext {
            module: self,
            field,
            name: &entry.name,
            source_fields: &entry.source_fields,
            number_of_components: entry.number_of_components,
        }
    }

    fn check_cache(&self, cache: &mut FieldCache) -> Result<(), FieldError> {
        if cache.module_id() != self.id {
            return Err(FieldError::ForeignCache);
        }
        cache.process_invalidations();
        Ok(())
    }

    /// true if the handle refers to a live field of this module
    pub fn is_valid(&self, field: FieldId) -> bool {
        self.entry(field).is_ok()
    }

    /// Live fields in slot order
    pub fn fields(&self) -> Vec<FieldId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.entry.is_some())
            .map(|(index, slot)| FieldId {
                module: self.id,
                index: index as u32,
                generation: slot.generation,
            })
            .collect()
    }

    pub fn number_of_fields(&self) -> usize {
        self.slots.iter().filter(|slot| slot.entry.is_some()).count()
    }

    ////////////////////////////////////////////////////////////////
    //  QUERIES
    ////////////////////////////////////////////////////////////////
    /// Component count of a field used as a source; a missing source is a construction error
    pub(crate) fn source_components(&self, source: FieldId) -> Result<usize, FieldError> {
        match self.entry(source) {
            Ok(entry) => Ok(entry.number_of_components),
            Err(FieldError::StaleField) => Err(FieldError::MissingSourceField),
            Err(error) => Err(error),
        }
    }

    pub fn number_of_components(&self, field: FieldId) -> Result<usize, FieldError> {
        Ok(self.entry(field)?.number_of_components)
    }

    pub fn source_fields(&self, field: FieldId) -> Result<Vec<FieldId>, FieldError> {
        Ok(self.entry(field)?.source_fields.clone())
    }

    pub fn source_field(&self, field: FieldId, index: usize) -> Result<FieldId, FieldError> {
        self.entry(field)?
            .source_fields
            .get(index)
            .copied()
            .ok_or(FieldError::MissingSourceField)
    }

    pub fn number_of_source_fields(&self, field: FieldId) -> Result<usize, FieldError> {
        Ok(self.entry(field)?.source_fields.len())
    }

    pub fn kind(&self, field: FieldId) -> Result<FieldKind, FieldError> {
        Ok(self.entry(field)?.core.kind())
    }

    pub fn type_string(&self, field: FieldId) -> Result<String, FieldError> {
        Ok(self.entry(field)?.core.type_string())
    }

    pub fn get_field_name(&self, field: FieldId) -> Option<String> {
        self.entry(field).ok().map(|entry| entry.name.clone())
    }

    pub fn find_field_by_name(&self, name: &str) -> Option<FieldId> {
        self.names.get(name).copied()
    }

    /// Copy of a field's definition, usable with `redefine_field` or `create_field`
    pub fn definition(&self, field: FieldId) -> Result<FieldDefinition, FieldError> {
        let entry = self.entry(field)?;
        Ok(FieldDefinition {
            core: entry.core.clone(),
            source_fields: entry.source_fields.clone(),
            number_of_components: entry.number_of_components,
        })
    }

    /// Same operator with the same settings, sources and component count
    pub fn compare_fields(&self, field: FieldId, other: FieldId) -> Result<bool, FieldError> {
        let a = self.entry(field)?;
        let b = self.entry(other)?;
        Ok(a.core.compare(&b.core)
            && a.source_fields == b.source_fields
            && a.number_of_components == b.number_of_components)
    }

    /// Highest non-vanishing order of `derivative` for the field (0 constant, 1 linear, ...).
    /// Computed once per field and derivative, so shared sources are not walked per path.
    pub fn derivative_tree_order(
        &self,
        field: FieldId,
        derivative: &FieldDerivative,
    ) -> Result<usize, FieldError> {
        let entry = self.entry(field)?;
        let key = (field, *derivative);
        let known = self
            .tree_orders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&key)
            .copied();
        if let Some(order) = known {
            return Ok(order);
        }
        // no lock held while the sources are visited
        let ctx = self.context(field, entry);
        let order = entry
            .core
            .derivative_tree_order(&ctx, derivative)
            .min(derivative.total_order());
        self.tree_orders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key, order);
        Ok(order)
    }

    fn forget_tree_orders(&self, field: Option<FieldId>) {
        let mut tree_orders = self
            .tree_orders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match field {
            Some(field) => tree_orders.retain(|(id, _), _| *id != field),
            None => tree_orders.clear(),
        }
    }

    pub(crate) fn tree_order(&self, field: FieldId, derivative: &FieldDerivative) -> usize {
        // an unknown field cannot be shown to vanish
        self.derivative_tree_order(field, derivative)
            .unwrap_or(derivative.total_order())
    }

    /// true if `field` is `target` or reaches it through its sources
    pub fn depends_on(&self, field: FieldId, target: FieldId) -> bool {
        let mut stack = vec![field];
        let mut visited = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == target {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            if let Ok(entry) = self.entry(current) {
                stack.extend(entry.source_fields.iter().copied());
            }
        }
        false
    }

    /// Fields listing `field` directly as a source
    pub fn dependents(&self, field: FieldId) -> Vec<FieldId> {
        self.fields()
            .into_iter()
            .filter(|&id| {
                self.entry(id)
                    .map(|entry| entry.source_fields.contains(&field))
                    .unwrap_or(false)
            })
            .collect()
    }

    ////////////////////////////////////////////////////////////////
    //  CONSTRUCTION
    ////////////////////////////////////////////////////////////////
    fn check_sources(&self, definition: &FieldDefinition) -> Result<(), FieldError> {
        for &source in &definition.source_fields {
            self.source_components(source)?;
        }
        if definition.number_of_components == 0 {
            return Err(FieldError::ComponentCountMismatch {
                expected: 1,
                found: 0,
            });
        }
        Ok(())
    }

    fn generate_name(&mut self, type_string: &str) -> String {
        loop {
            self.name_counter += 1;
            let name = format!("{}{}", type_string, self.name_counter);
            if !self.names.contains_key(&name) {
                return name;
            }
        }
    }

    /// Add a validated definition as a new, automatically named field
    pub fn create_field(&mut self, definition: FieldDefinition) -> Result<FieldId, FieldError> {
        self.check_sources(&definition)?;
        let name = self.generate_name(&definition.core.type_string());
        Ok(self.insert(name, definition))
    }

    /// Add a validated definition under a chosen, unused name
    pub fn create_named_field(
        &mut self,
        name: &str,
        definition: FieldDefinition,
    ) -> Result<FieldId, FieldError> {
        check_name(name)?;
        if self.names.contains_key(name) {
            return Err(FieldError::DuplicateName(name.to_string()));
        }
        self.check_sources(&definition)?;
        Ok(self.insert(name.to_string(), definition))
    }

    fn insert(&mut self, name: String, definition: FieldDefinition) -> FieldId {
        info!(
            "created field '{}' ({} components)",
            name, definition.number_of_components
        );
        let entry = FieldEntry {
            name: name.clone(),
            core: definition.core,
            source_fields: definition.source_fields,
            number_of_components: definition.number_of_components,
        };
        let index = match self.free_slots.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.entry = Some(entry);
        let id = FieldId {
            module: self.id,
            index,
            generation: slot.generation,
        };
        self.names.insert(name, id);
        id
    }

    pub fn create_constant(&mut self, values: &[f64]) -> Result<FieldId, FieldError> {
        self.create_field(Constant::definition(values)?)
    }

    pub fn create_external(&mut self, provider: Arc<dyn FieldProvider>) -> Result<FieldId, FieldError> {
        self.create_field(External::definition(provider)?)
    }

    pub fn create_normalise(&mut self, source: FieldId) -> Result<FieldId, FieldError> {
        let definition = Normalise::definition(self, source)?;
        self.create_field(definition)
    }

    pub fn create_cross_product(
        &mut self,
        dimension: usize,
        sources: &[FieldId],
    ) -> Result<FieldId, FieldError> {
        let definition = CrossProduct::definition(self, dimension, sources)?;
        self.create_field(definition)
    }

    pub fn create_dot_product(
        &mut self,
        source1: FieldId,
        source2: FieldId,
    ) -> Result<FieldId, FieldError> {
        let definition = DotProduct::definition(self, source1, source2)?;
        self.create_field(definition)
    }

    pub fn create_magnitude(&mut self, source: FieldId) -> Result<FieldId, FieldError> {
        let definition = Magnitude::definition(self, source)?;
        self.create_field(definition)
    }

    pub fn create_sum_components(&mut self, source: FieldId) -> Result<FieldId, FieldError> {
        let definition = SumComponents::definition(self, source)?;
        self.create_field(definition)
    }

    pub fn create_cubic_texture_coordinates(
        &mut self,
        source: FieldId,
    ) -> Result<FieldId, FieldError> {
        let definition = CubicTextureCoordinates::definition(self, source)?;
        self.create_field(definition)
    }

    ////////////////////////////////////////////////////////////////
    //  MANAGEMENT
    ////////////////////////////////////////////////////////////////
    pub fn set_field_name(&mut self, field: FieldId, name: &str) -> Result<(), FieldError> {
        check_name(name)?;
        match self.names.get(name) {
            Some(&existing) if existing == field => return Ok(()),
            Some(_) => return Err(FieldError::DuplicateName(name.to_string())),
            None => {}
        }
        let entry = self.entry_mut(field)?;
        let old = std::mem::replace(&mut entry.name, name.to_string());
        self.names.remove(&old);
        self.names.insert(name.to_string(), field);
        debug!("renamed field '{}' to '{}'", old, name);
        Ok(())
    }

    /// Remove a field no other field depends on; its handle becomes stale
    pub fn remove_field(&mut self, field: FieldId) -> Result<(), FieldError> {
        let name = self.entry(field)?.name.clone();
        if let Some(dependent) = self.dependents(field).first() {
            warn!(
                "cannot remove field '{}': source of '{}'",
                name,
                self.get_field_name(*dependent).unwrap_or_default()
            );
            return Err(FieldError::FieldInUse(name));
        }
        let slot = &mut self.slots[field.index as usize];
        slot.entry = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_slots.push(field.index);
        self.names.remove(&name);
        {
            let mut state = self
                .change_state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state.pending.remove(&field);
        }
        self.forget_tree_orders(Some(field));
        self.send(CacheMessage::Remove(field));
        info!("removed field '{}'", name);
        Ok(())
    }

    /// Replace the operator and sources of a field in place. The component count is kept,
    /// and sources depending on the field itself are rejected.
    pub fn redefine_field(
        &mut self,
        field: FieldId,
        definition: FieldDefinition,
    ) -> Result<(), FieldError> {
        let (name, number_of_components) = {
            let entry = self.entry(field)?;
            (entry.name.clone(), entry.number_of_components)
        };
        if definition.number_of_components != number_of_components {
            return Err(FieldError::ComponentCountMismatch {
                expected: number_of_components,
                found: definition.number_of_components,
            });
        }
        self.check_sources(&definition)?;
        if definition
            .source_fields
            .iter()
            .any(|&source| self.depends_on(source, field))
        {
            warn!("rejected cyclic redefinition of field '{}'", name);
            return Err(FieldError::CyclicDependency(name));
        }
        let entry = self.entry_mut(field)?;
        entry.core = definition.core;
        entry.source_fields = definition.source_fields;
        // dependents' tree orders may change too
        self.forget_tree_orders(None);
        info!("redefined field '{}'", name);
        self.field_changed(field);
        Ok(())
    }

    ////////////////////////////////////////////////////////////////
    //  CHANGE MANAGER
    ////////////////////////////////////////////////////////////////
    pub fn begin_change(&self) {
        let mut state = self
            .change_state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.level += 1;
    }

    pub fn end_change(&self) {
        let pending = {
            let mut state = self
                .change_state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if state.level == 0 {
                warn!("end_change without matching begin_change");
                return;
            }
            state.level -= 1;
            if state.level > 0 {
                return;
            }
            std::mem::take(&mut state.pending)
        };
        self.flush(pending);
    }

    /// Change bracket closed when the guard is dropped
    pub fn change_guard(&self) -> ChangeGuard<'_> {
        self.begin_change();
        ChangeGuard { module: self }
    }

    /// Record that the values or definition of `field` changed
    pub(crate) fn field_changed(&self, field: FieldId) {
        let pending = {
            let mut state = self
                .change_state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state.pending.insert(field);
            if state.level > 0 {
                return;
            }
            std::mem::take(&mut state.pending)
        };
        self.flush(pending);
    }

    fn flush(&self, changed: HashSet<FieldId>) {
        if changed.is_empty() {
            return;
        }
        let affected = self.with_dependents(changed);
        self.broadcast(affected.into_iter().collect());
    }

    /// `changed` plus every field depending on one of them, directly or not
    fn with_dependents(&self, changed: HashSet<FieldId>) -> HashSet<FieldId> {
        let mut affected = changed;
        let mut grown = true;
        while grown {
            grown = false;
            for id in self.fields() {
                if affected.contains(&id) {
                    continue;
                }
                let depends = self
                    .entry(id)
                    .map(|entry| entry.source_fields.iter().any(|s| affected.contains(s)))
                    .unwrap_or(false);
                if depends {
                    affected.insert(id);
                    grown = true;
                }
            }
        }
        affected
    }

    fn broadcast(&self, fields: Vec<FieldId>) {
        debug!("invalidating {} fields", fields.len());
        self.send(CacheMessage::Invalidate(fields));
    }

    fn send(&self, message: CacheMessage) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // a failed send means the cache was dropped
        subscribers.retain(|sender| sender.send(message.clone()).is_ok());
    }

    ////////////////////////////////////////////////////////////////
    //  EVALUATION
    ////////////////////////////////////////////////////////////////
    /// Values of `field` at the cache location
    pub fn evaluate(
        &self,
        cache: &mut FieldCache,
        field: FieldId,
    ) -> Result<DVector<f64>, FieldError> {
        self.check_cache(cache)?;
        self.evaluate_cached(cache, field)
    }

    /// Values of `field` written into `values`, which must hold exactly its components.
    /// Nothing is written on failure.
    pub fn evaluate_real(
        &self,
        cache: &mut FieldCache,
        field: FieldId,
        values: &mut [f64],
    ) -> Result<(), FieldError> {
        let number_of_components = self.number_of_components(field)?;
        if values.len() != number_of_components {
            return Err(FieldError::ComponentCountMismatch {
                expected: number_of_components,
                found: values.len(),
            });
        }
        let result = self.evaluate(cache, field)?;
        values.copy_from_slice(result.as_slice());
        Ok(())
    }

    pub fn evaluate_derivative(
        &self,
        cache: &mut FieldCache,
        field: FieldId,
        derivative: &FieldDerivative,
    ) -> Result<DerivativeValueCache, FieldError> {
        self.check_cache(cache)?;
        let values = self.evaluate_derivative_cached(cache, field, derivative)?;
        Ok(DerivativeValueCache::new(*derivative, values))
    }

    /// Derivative of `field` flattened component by component into `values`
    /// (`number_of_components * term_count` long). Nothing is written on failure.
    pub fn evaluate_derivative_real(
        &self,
        cache: &mut FieldCache,
        field: FieldId,
        derivative: &FieldDerivative,
        values: &mut [f64],
    ) -> Result<(), FieldError> {
        let expected = self.number_of_components(field)? * derivative.term_count();
        if values.len() != expected {
            return Err(FieldError::ComponentCountMismatch {
                expected,
                found: values.len(),
            });
        }
        let result = self.evaluate_derivative(cache, field, derivative)?;
        values.copy_from_slice(&result.as_flat());
        Ok(())
    }

    /// Memoized evaluation used by kernels for their sources. The value cache is only
    /// written once the kernel succeeded.
    pub(crate) fn evaluate_cached(
        &self,
        cache: &mut FieldCache,
        field: FieldId,
    ) -> Result<DVector<f64>, FieldError> {
        let entry = self.entry(field)?;
        if let Some(values) = cache.value_cache(field).values() {
            return Ok(values.clone());
        }
        debug!("evaluating field '{}'", entry.name);
        let ctx = self.context(field, entry);
        let values = entry.core.evaluate(&ctx, cache)?;
        if values.len() != entry.number_of_components {
            return Err(FieldError::ComponentCountMismatch {
                expected: entry.number_of_components,
                found: values.len(),
            });
        }
        cache.value_cache(field).set_values(values.clone());
        Ok(values)
    }

    fn check_derivative_applicable(
        &self,
        cache: &FieldCache,
        derivative: &FieldDerivative,
    ) -> Result<(), FieldError> {
        if derivative.mesh_order() > 0 {
            match cache.location() {
                None => return Err(FieldError::LocationNotSet),
                Some(Location::Mesh(mesh_location))
                    if mesh_location.xi.len() == derivative.mesh_dimension() => {}
                Some(_) => {
                    return Err(FieldError::DerivativeNotApplicable(format!(
                        "mesh derivative of dimension {} needs a mesh location of that dimension",
                        derivative.mesh_dimension()
                    )));
                }
            }
        }
        if derivative.parameter_order() > 0 && cache.parameters().len() != derivative.parameter_count()
        {
            return Err(FieldError::DerivativeNotApplicable(format!(
                "parameter derivative over {} parameters, cache has {}",
                derivative.parameter_count(),
                cache.parameters().len()
            )));
        }
        Ok(())
    }

    pub(crate) fn evaluate_derivative_cached(
        &self,
        cache: &mut FieldCache,
        field: FieldId,
        derivative: &FieldDerivative,
    ) -> Result<DMatrix<f64>, FieldError> {
        let entry = self.entry(field)?;
        self.check_derivative_applicable(cache, derivative)?;
        if let Some(stored) = cache.value_cache(field).derivative(derivative) {
            return Ok(stored.values.clone());
        }
        let ctx = self.context(field, entry);
        let values = if self.tree_order(field, derivative) < derivative.total_order() {
            // vanishes identically, but only where the field is defined
            self.evaluate_cached(cache, field)?;
            ctx.zero_derivative(derivative)
        } else {
            debug!("evaluating {:?} of field '{}'", derivative, entry.name);
            entry.core.evaluate_derivative(&ctx, cache, derivative)?
        };
        if values.nrows() != entry.number_of_components || values.ncols() != derivative.term_count()
        {
            return Err(FieldError::ComponentCountMismatch {
                expected: entry.number_of_components * derivative.term_count(),
                found: values.len(),
            });
        }
        cache
            .value_cache(field)
            .set_derivative(DerivativeValueCache::new(*derivative, values.clone()));
        Ok(values)
    }

    ////////////////////////////////////////////////////////////////
    //  ASSIGNMENT
    ////////////////////////////////////////////////////////////////
    /// Assign values to `field` at the cache location. Derived assignable fields (magnitude)
    /// pass the assignment on to their sources. All resulting invalidations are sent as one
    /// batch.
    pub fn assign_real(
        &self,
        cache: &mut FieldCache,
        field: FieldId,
        values: &[f64],
    ) -> Result<(), FieldError> {
        self.check_cache(cache)?;
        let number_of_components = self.number_of_components(field)?;
        if values.len() != number_of_components {
            return Err(FieldError::ComponentCountMismatch {
                expected: number_of_components,
                found: values.len(),
            });
        }
        let _guard = self.change_guard();
        self.assign_cached(cache, field, &DVector::from_column_slice(values))
    }

    pub(crate) fn assign_cached(
        &self,
        cache: &mut FieldCache,
        field: FieldId,
        values: &DVector<f64>,
    ) -> Result<(), FieldError> {
        let entry = self.entry(field)?;
        let ctx = self.context(field, entry);
        entry.core.assign(&ctx, cache, values)?;
        // the writing cache sees its own writes at once, even inside a change bracket
        let affected = self.with_dependents(HashSet::from([field]));
        cache.invalidate_fields(&affected);
        Ok(())
    }
}

// names must survive a round trip through command strings
fn check_name(name: &str) -> Result<(), FieldError> {
    if name.is_empty() || name.contains(char::is_whitespace) {
        return Err(FieldError::Parse(format!("invalid field name '{}'", name)));
    }
    Ok(())
}
