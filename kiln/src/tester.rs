use crate::context::Context;
use crate::document::{to_document, Document, Value};
use crate::driver::{FindOptions, SortKey, UpdateOptions};
use crate::errors::KilnResult;
use crate::id::ID;
use crate::model::{Meta, Model, ID_FIELD, SCORE_FIELD};
use crate::store::Store;

fn id_filter(id: ID) -> Document {
    let mut filter = Document::new();
    filter.insert(ID_FIELD.to_string(), Value::from(id));
    filter
}

/// Fixture helpers for tests that work with a store.
///
/// The tester talks to the collections directly. It skips the validation,
/// transaction and locking rules of the [`Manager`](crate::manager::Manager),
/// so tests can set up and inspect any state.
///
/// Models are registered with [`Tester::with`]; [`Tester::clean`] empties
/// the collections of all registered models.
#[derive(Debug, Clone)]
pub struct Tester {
    store: Store,
    models: Vec<&'static Meta>,
}

impl Tester {
    pub fn new(store: Store) -> Self {
        Tester {
            store,
            models: Vec::new(),
        }
    }

    /// Registers a model whose collection is emptied by `clean`.
    pub fn with<M: Model>(mut self) -> Self {
        let meta = M::meta();
        if !self.models.contains(&meta) {
            self.models.push(meta);
        }
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Deletes all documents of the registered models.
    pub fn clean(&self) -> KilnResult<()> {
        let ctx = Context::background();
        let db = self.store.db();
        for meta in &self.models {
            db.collection(meta.collection()).delete_many(&ctx, &Document::new())?;
        }
        Ok(())
    }

    /// Inserts the model as is. A zero id is replaced with a new id first.
    pub fn save<M: Model>(&self, mut model: M) -> KilnResult<M> {
        if model.id().is_zero() {
            model.base_mut().id = ID::new();
        }
        let mut doc = to_document(&model)?;
        doc.remove(SCORE_FIELD);
        self.store.c::<M>().insert_one(&Context::background(), doc)?;
        Ok(model)
    }

    /// Returns all models that match the filter in insertion order.
    pub fn find_all<M: Model>(&self, filter: &Document) -> KilnResult<Vec<M>> {
        let options = FindOptions::new().sort(vec![SortKey::asc(ID_FIELD)]);
        self.store.c::<M>().find_all(&Context::background(), filter, options)
    }

    /// Returns the last inserted model that matches the filter.
    pub fn find_last<M: Model>(&self, filter: &Document) -> KilnResult<M> {
        let options = FindOptions::new().sort(vec![SortKey::desc(ID_FIELD)]);
        self.store
            .c::<M>()
            .find_one(&Context::background(), filter, options)?
            .decode()
    }

    pub fn count<M: Model>(&self, filter: &Document) -> KilnResult<u64> {
        self.store
            .c::<M>()
            .count_documents(&Context::background(), filter, FindOptions::new())
    }

    /// Returns the model with the specified id. Fails with `NoDocuments` if
    /// it does not exist.
    pub fn fetch<M: Model>(&self, id: ID) -> KilnResult<M> {
        self.store
            .c::<M>()
            .find_one(&Context::background(), &id_filter(id), FindOptions::new())?
            .decode()
    }

    /// Replaces the stored document with the model.
    pub fn update<M: Model>(&self, model: M) -> KilnResult<M> {
        let mut doc = to_document(&model)?;
        doc.remove(SCORE_FIELD);
        self.store.c::<M>().replace_one(
            &Context::background(),
            &id_filter(model.id()),
            doc,
            UpdateOptions::default(),
        )?;
        Ok(model)
    }

    pub fn delete<M: Model>(&self, model: &M) -> KilnResult<()> {
        self.store
            .c::<M>()
            .delete_one(&Context::background(), &id_filter(model.id()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;
    use crate::errors::is_missing;
    use crate::model::{Base, Validate};
    use crate::Model;
    use serde::{Deserialize, Serialize};

    #[derive(Model, Serialize, Deserialize, Default, Debug, Clone, PartialEq)]
    #[model(collection = "things")]
    struct Thing {
        #[serde(flatten)]
        base: Base,
        name: String,
    }

    impl Validate for Thing {
        fn validate(&self) -> anyhow::Result<()> {
            anyhow::bail!("never valid")
        }
    }

    fn thing(name: &str) -> Thing {
        Thing {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn tester() -> Tester {
        Tester::new(Store::open(None, "test").unwrap()).with::<Thing>().with::<Thing>()
    }

    #[test]
    fn test_save_and_fetch_skip_validation() {
        let tester = tester();
        let saved = tester.save(thing("a")).unwrap();
        assert!(!saved.id().is_zero());

        let fetched: Thing = tester.fetch(saved.id()).unwrap();
        assert_eq!(fetched, saved);

        let err = tester.fetch::<Thing>(ID::new()).unwrap_err();
        assert!(is_missing(&err));
    }

    #[test]
    fn test_find_all_and_last() {
        let tester = tester();
        tester.save(thing("a")).unwrap();
        tester.save(thing("b")).unwrap();
        tester.save(thing("c")).unwrap();

        let all: Vec<Thing> = tester.find_all(&doc! {}).unwrap();
        let names: Vec<&str> = all.iter().map(|thing| thing.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);

        let last: Thing = tester.find_last(&doc! { "name": { "$ne": "c" } }).unwrap();
        assert_eq!(last.name, "b");
        assert_eq!(tester.count::<Thing>(&doc! {}).unwrap(), 3);
    }

    #[test]
    fn test_update_delete_and_clean() {
        let tester = tester();
        let mut saved = tester.save(thing("a")).unwrap();
        tester.save(thing("b")).unwrap();

        saved.name = "z".to_string();
        let saved = tester.update(saved).unwrap();
        assert_eq!(tester.fetch::<Thing>(saved.id()).unwrap().name, "z");

        tester.delete(&saved).unwrap();
        assert_eq!(tester.count::<Thing>(&doc! {}).unwrap(), 1);

        tester.clean().unwrap();
        assert_eq!(tester.count::<Thing>(&doc! {}).unwrap(), 0);
    }
}
