use mongodb::bson::oid::ObjectId;
use mongodb::bson::{doc, Bson, Document};
use mongodb_crud::{
    check, load, reset, Column, CrudModel, Database, Error, Failure, HealthStatus, LoadError,
    ValidationFailed,
};
use std::sync::Arc;

fn test_model() -> CrudModel {
    CrudModel::builder("test")
        .column(Column::string("key").primary_key().unique())
        .column(Column::int("mandatory").not_nullable())
        .column(Column::string("optional"))
        .column(Column::datetime("dated"))
        .column(Column::string("with_default").default_value("default"))
        .build()
        .unwrap()
}

async fn get_db(model: &CrudModel) -> Database {
    load("mongomock", &[model]).await.unwrap()
}

fn failure(error: Error) -> ValidationFailed {
    match error {
        Error::ValidationFailed(failed) => failed,
        other => panic!("expected a validation failure, got {other:?}"),
    }
}

#[tokio::test]
async fn add_then_get_applies_defaults() {
    let model = test_model();
    let db = get_db(&model).await;

    let added = model
        .bind(&db)
        .add(doc! {"key": "my_key", "mandatory": 1, "dated": "2017-09-24T15:36:09"})
        .await
        .unwrap();
    let expected = doc! {
        "key": "my_key",
        "mandatory": 1_i64,
        "optional": Bson::Null,
        "dated": "2017-09-24T15:36:09",
        "with_default": "default",
    };
    assert_eq!(added, expected);
    let found = model.bind(&db).get(doc! {"key": "my_key"}).await.unwrap();
    assert_eq!(found, Some(expected));
}

#[tokio::test]
async fn missing_mandatory_field_is_rejected() {
    let model = test_model();
    let db = get_db(&model).await;

    let error = model.bind(&db).add(doc! {"key": "my_key"}).await.unwrap_err();
    let failed = failure(error);
    assert_eq!(failed.errors_for("mandatory"), ["Missing data for required field."]);
    assert_eq!(failed.received, Bson::Document(doc! {"key": "my_key"}));
}

#[tokio::test]
async fn empty_document_is_rejected() {
    let model = test_model();
    let db = get_db(&model).await;

    let failed = failure(model.bind(&db).add(doc! {}).await.unwrap_err());
    assert_eq!(failed.failure, Failure::Message("No data provided.".to_string()));
    let failed = failure(model.bind(&db).add_all(vec![]).await.unwrap_err());
    assert_eq!(failed.failure, Failure::Message("No data provided.".to_string()));
}

#[tokio::test]
async fn invalid_types_are_reported_per_field() {
    let model = test_model();
    let db = get_db(&model).await;

    let error = model
        .bind(&db)
        .add(doc! {"key": 1, "mandatory": "one", "dated": "yesterday"})
        .await
        .unwrap_err();
    let failed = failure(error);
    assert_eq!(failed.errors_for("key"), ["Not a valid str."]);
    assert_eq!(failed.errors_for("mandatory"), ["Not a valid int."]);
    assert_eq!(failed.errors_for("dated"), ["Not a valid datetime."]);
}

#[tokio::test]
async fn unknown_fields_are_dropped() {
    let model = test_model();
    let db = get_db(&model).await;

    let added = model
        .bind(&db)
        .add(doc! {"key": "my_key", "mandatory": 1, "unknown": "value"})
        .await
        .unwrap();
    assert!(!added.contains_key("unknown"));
    let (_, updated) = model
        .bind(&db)
        .update(doc! {"key": "my_key", "mandatory": 2, "unknown": "value"})
        .await
        .unwrap();
    assert!(!updated.contains_key("unknown"));
    assert_eq!(updated.get_i64("mandatory").unwrap(), 2);
}

#[tokio::test]
async fn existing_document_is_a_conflict() {
    let model = test_model();
    let db = get_db(&model).await;

    model.bind(&db).add(doc! {"key": "my_key", "mandatory": 1}).await.unwrap();
    let error = model
        .bind(&db)
        .add(doc! {"key": "my_key", "mandatory": 2})
        .await
        .unwrap_err();
    assert_eq!(
        failure(error).failure,
        Failure::Message("This document already exists.".to_string())
    );
}

#[tokio::test]
async fn batch_is_rejected_as_a_whole() {
    let model = test_model();
    let db = get_db(&model).await;

    let error = model
        .bind(&db)
        .add_all(vec![
            doc! {"key": "first", "mandatory": 1},
            doc! {"key": "second"},
            doc! {"key": "third", "mandatory": 3},
        ])
        .await
        .unwrap_err();
    let Failure::Batch(errors) = failure(error).failure else {
        panic!("expected per position errors");
    };
    assert_eq!(errors.keys().copied().collect::<Vec<_>>(), vec![1]);
    assert_eq!(errors[&1]["mandatory"], vec!["Missing data for required field.".to_string()]);
    assert!(model.bind(&db).get_all(doc! {}).await.unwrap().is_empty());

    let added = model
        .bind(&db)
        .add_all(vec![
            doc! {"key": "first", "mandatory": 1},
            doc! {"key": "second", "mandatory": 2},
        ])
        .await
        .unwrap();
    assert_eq!(added.len(), 2);
    assert_eq!(model.bind(&db).get_all(doc! {}).await.unwrap().len(), 2);
}

#[tokio::test]
async fn batch_with_duplicate_keys_stores_nothing() {
    let model = CrudModel::builder("test")
        .column(Column::string("key").primary_key().unique())
        .audited()
        .build()
        .unwrap();
    let db = get_db(&model).await;

    let error = model
        .bind(&db)
        .add_all(vec![doc! {"key": "a"}, doc! {"key": "b"}, doc! {"key": "a"}])
        .await
        .unwrap_err();
    assert_eq!(
        failure(error).failure,
        Failure::Message("This document already exists.".to_string())
    );
    assert!(model.bind(&db).get_all(doc! {}).await.unwrap().is_empty());
    assert!(model.bind(&db).get_audit(doc! {}).await.unwrap().is_empty());

    model.bind(&db).add(doc! {"key": "a"}).await.unwrap();
    assert_eq!(model.bind(&db).get_all(doc! {}).await.unwrap().len(), 1);
}

#[tokio::test]
async fn update_returns_previous_and_new() {
    let model = test_model();
    let db = get_db(&model).await;

    model
        .bind(&db)
        .add(doc! {"key": "my_key", "mandatory": 1, "optional": "value"})
        .await
        .unwrap();
    let (previous, new) = model
        .bind(&db)
        .update(doc! {"key": "my_key", "mandatory": 2, "optional": Bson::Null})
        .await
        .unwrap();
    assert_eq!(previous.get_i64("mandatory").unwrap(), 1);
    assert_eq!(previous.get_str("optional").unwrap(), "value");
    assert_eq!(new.get_i64("mandatory").unwrap(), 2);
    assert_eq!(new.get("optional"), Some(&Bson::Null));
}

#[tokio::test]
async fn update_of_unknown_record_is_not_found() {
    let model = test_model();
    let db = get_db(&model).await;

    let error = model
        .bind(&db)
        .update(doc! {"key": "unknown", "mandatory": 1})
        .await
        .unwrap_err();
    assert!(matches!(error, Error::ModelCouldNotBeFound { .. }));
}

#[tokio::test]
async fn update_requires_primary_key() {
    let model = test_model();
    let db = get_db(&model).await;

    let error = model.bind(&db).update(doc! {"mandatory": 1}).await.unwrap_err();
    assert_eq!(failure(error).errors_for("key"), ["Missing data for required field."]);

    let keyless = CrudModel::builder("keyless")
        .column(Column::string("value"))
        .build()
        .unwrap();
    let error = keyless.bind(&db).update(doc! {"value": "a"}).await.unwrap_err();
    assert_eq!(
        failure(error).failure,
        Failure::Message("keyless has no primary key.".to_string())
    );
}

#[tokio::test]
async fn get_with_more_than_one_result_is_ambiguous() {
    let model = test_model();
    let db = get_db(&model).await;

    assert_eq!(model.bind(&db).get(doc! {}).await.unwrap(), None);
    assert!(model.bind(&db).get_all(doc! {}).await.unwrap().is_empty());

    model.bind(&db).add(doc! {"key": "first", "mandatory": 1}).await.unwrap();
    model.bind(&db).add(doc! {"key": "second", "mandatory": 1}).await.unwrap();
    let error = model.bind(&db).get(doc! {"mandatory": 1}).await.unwrap_err();
    assert_eq!(
        failure(error).failure,
        Failure::Message("More than one result: Consider another filtering.".to_string())
    );
}

#[tokio::test]
async fn get_all_filters_and_paginates() {
    let model = test_model();
    let db = get_db(&model).await;
    for (key, mandatory) in [("a", 1), ("b", 2), ("c", 3)] {
        model
            .bind(&db)
            .add(doc! {"key": key, "mandatory": mandatory})
            .await
            .unwrap();
    }

    let found = model.bind(&db).get_all(doc! {"key": ["a", "c"]}).await.unwrap();
    let keys: Vec<&str> = found.iter().map(|d| d.get_str("key").unwrap()).collect();
    assert_eq!(keys, vec!["a", "c"]);

    let page = model
        .bind(&db)
        .get_all(doc! {"limit": 2, "offset": 1})
        .await
        .unwrap();
    let keys: Vec<&str> = page.iter().map(|d| d.get_str("key").unwrap()).collect();
    assert_eq!(keys, vec!["b", "c"]);

    let error = model.bind(&db).get_all(doc! {"limit": 0}).await.unwrap_err();
    assert_eq!(failure(error).errors_for("limit"), ["Not a valid positive integer."]);

    let error = model.bind(&db).get_all(doc! {"mandatory": "x"}).await.unwrap_err();
    assert_eq!(failure(error).errors_for("mandatory"), ["Not a valid int."]);
}

#[tokio::test]
async fn remove_returns_removed_count() {
    let model = test_model();
    let db = get_db(&model).await;
    model.bind(&db).add(doc! {"key": "a", "mandatory": 1}).await.unwrap();
    model.bind(&db).add(doc! {"key": "b", "mandatory": 1}).await.unwrap();

    assert_eq!(model.bind(&db).remove(doc! {"key": "a"}).await.unwrap(), 1);
    assert_eq!(model.bind(&db).remove(doc! {"key": "a"}).await.unwrap(), 0);
    assert_eq!(model.bind(&db).remove(doc! {}).await.unwrap(), 1);
}

#[tokio::test]
async fn auto_increment_is_never_reused() {
    let model = CrudModel::builder("test")
        .column(Column::int("key").primary_key().auto_increment())
        .column(Column::string("value"))
        .build()
        .unwrap();
    let db = get_db(&model).await;

    let first = model.bind(&db).add(doc! {"value": "first"}).await.unwrap();
    assert_eq!(first, doc! {"key": 1_i64, "value": "first"});
    assert_eq!(model.bind(&db).remove(doc! {}).await.unwrap(), 1);
    let second = model.bind(&db).add(doc! {"value": "second"}).await.unwrap();
    assert_eq!(second, doc! {"key": 2_i64, "value": "second"});
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_adds_get_distinct_keys() {
    let model = Arc::new(
        CrudModel::builder("test")
            .column(Column::int("key").primary_key().auto_increment())
            .column(Column::int("value"))
            .build()
            .unwrap(),
    );
    let db = get_db(&model).await;

    let tasks: Vec<_> = (0..20)
        .map(|value| {
            let model = Arc::clone(&model);
            let db = db.clone();
            tokio::spawn(async move { model.bind(&db).add(doc! {"value": value}).await })
        })
        .collect();
    let mut keys = vec![];
    for task in tasks {
        keys.push(task.await.unwrap().unwrap().get_i64("key").unwrap());
    }
    keys.sort_unstable();
    assert_eq!(keys, (1..=20).collect::<Vec<i64>>());
    assert_eq!(model.bind(&db).get_all(doc! {}).await.unwrap().len(), 20);
}

#[tokio::test]
async fn declared_object_id_is_the_primary_key() {
    let model = CrudModel::builder("test")
        .column(Column::object_id("_id").primary_key())
        .column(Column::string("value"))
        .build()
        .unwrap();
    let db = get_db(&model).await;
    let id = ObjectId::new().to_hex();

    let added = model
        .bind(&db)
        .add(doc! {"_id": id.as_str(), "value": "first"})
        .await
        .unwrap();
    assert_eq!(added, doc! {"_id": id.as_str(), "value": "first"});

    let found = model.bind(&db).get(doc! {"_id": id.as_str()}).await.unwrap();
    assert_eq!(found, Some(added));

    let (previous, new) = model
        .bind(&db)
        .update(doc! {"_id": id.as_str(), "value": "second"})
        .await
        .unwrap();
    assert_eq!(previous, doc! {"_id": id.as_str(), "value": "first"});
    assert_eq!(new, doc! {"_id": id.as_str(), "value": "second"});

    let all = model.bind(&db).get_all(doc! {}).await.unwrap();
    assert_eq!(all, vec![doc! {"_id": id.as_str(), "value": "second"}]);
    assert_eq!(model.bind(&db).remove(doc! {"_id": id.as_str()}).await.unwrap(), 1);
}

fn default_key_model() -> CrudModel {
    CrudModel::builder("test")
        .column(Column::string("key").primary_key().default_value("test"))
        .column(Column::string("optional"))
        .build()
        .unwrap()
}

#[tokio::test]
async fn post_without_primary_key_but_default_value() {
    let model = default_key_model();
    let db = get_db(&model).await;

    let added = model.bind(&db).add(doc! {"optional": "test2"}).await.unwrap();
    assert_eq!(added, doc! {"key": "test", "optional": "test2"});
}

#[tokio::test]
async fn get_and_delete_on_default_value() {
    let model = default_key_model();
    let db = get_db(&model).await;
    model.bind(&db).add(doc! {"optional": "test"}).await.unwrap();
    model
        .bind(&db)
        .add(doc! {"key": "test2", "optional": "test2"})
        .await
        .unwrap();

    let found = model.bind(&db).get_all(doc! {"key": "test"}).await.unwrap();
    assert_eq!(found, vec![doc! {"key": "test", "optional": "test"}]);
    assert_eq!(model.bind(&db).remove(doc! {"key": "test"}).await.unwrap(), 1);
}

#[tokio::test]
async fn put_without_primary_key_but_default_value() {
    let model = default_key_model();
    let db = get_db(&model).await;
    model.bind(&db).add(doc! {"optional": "test2"}).await.unwrap();

    let updated = model.bind(&db).update(doc! {"optional": "test3"}).await.unwrap();
    assert_eq!(
        updated,
        (
            doc! {"key": "test", "optional": "test2"},
            doc! {"key": "test", "optional": "test3"}
        )
    );
}

fn sorted_list_model() -> CrudModel {
    CrudModel::builder("test")
        .column(Column::string("key").primary_key())
        .column(Column::list("list_field", Column::string("item")).sorted())
        .build()
        .unwrap()
}

#[tokio::test]
async fn post_list_of_str_is_sorted() {
    let model = sorted_list_model();
    let db = get_db(&model).await;

    let added = model
        .bind(&db)
        .add(doc! {"key": "my_key", "list_field": ["c", "a", "b"]})
        .await
        .unwrap();
    assert_eq!(added, doc! {"key": "my_key", "list_field": ["a", "b", "c"]});
}

#[tokio::test]
async fn put_list_of_str_is_sorted() {
    let model = sorted_list_model();
    let db = get_db(&model).await;
    model
        .bind(&db)
        .add(doc! {"key": "my_key", "list_field": ["a", "c", "b"]})
        .await
        .unwrap();

    let updated = model
        .bind(&db)
        .update(doc! {"key": "my_key", "list_field": ["f", "e", "d"]})
        .await
        .unwrap();
    assert_eq!(
        updated,
        (
            doc! {"key": "my_key", "list_field": ["a", "b", "c"]},
            doc! {"key": "my_key", "list_field": ["d", "e", "f"]}
        )
    );
}

#[tokio::test]
async fn list_filters_require_every_value() {
    let model = sorted_list_model();
    let db = get_db(&model).await;
    model
        .bind(&db)
        .add(doc! {"key": "first", "list_field": ["a", "b"]})
        .await
        .unwrap();
    model
        .bind(&db)
        .add(doc! {"key": "second", "list_field": ["b", "c"]})
        .await
        .unwrap();

    let found = model
        .bind(&db)
        .get_all(doc! {"list_field": ["b", "a"]})
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get_str("key").unwrap(), "first");
    let found = model.bind(&db).get_all(doc! {"list_field": "b"}).await.unwrap();
    assert_eq!(found.len(), 2);
}

#[tokio::test]
async fn dotted_filters_target_nested_fields() {
    let model = CrudModel::builder("test")
        .column(Column::string("key").primary_key())
        .column(
            Column::dict(
                "dict_field",
                vec![
                    Column::string("first_key").not_nullable(),
                    Column::int("second_key"),
                ],
            )
            .unwrap(),
        )
        .build()
        .unwrap();
    let db = get_db(&model).await;

    let error = model
        .bind(&db)
        .add(doc! {"key": "a", "dict_field": {"second_key": 1}})
        .await
        .unwrap_err();
    assert_eq!(
        failure(error).errors_for("dict_field.first_key"),
        ["Missing data for required field."]
    );

    model
        .bind(&db)
        .add(doc! {"key": "a", "dict_field": {"first_key": "x", "second_key": 1}})
        .await
        .unwrap();
    let added = model.bind(&db).add(doc! {"key": "b"}).await.unwrap();
    assert_eq!(
        added,
        doc! {"key": "b", "dict_field": {"first_key": Bson::Null, "second_key": Bson::Null}}
    );

    let found = model
        .bind(&db)
        .get_all(doc! {"dict_field.second_key": 1})
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get_str("key").unwrap(), "a");

    let error = model
        .bind(&db)
        .get_all(doc! {"dict_field.second_key": "one"})
        .await
        .unwrap_err();
    assert_eq!(
        failure(error).errors_for("dict_field.second_key"),
        ["Not a valid int."]
    );
}

#[tokio::test]
async fn indexes_are_created_on_load() {
    let model = CrudModel::builder("test")
        .column(Column::string("key").primary_key().unique())
        .column(Column::string("category").index(mongodb_crud::IndexType::NonUnique))
        .build()
        .unwrap();
    let db = get_db(&model).await;

    let mut names = db.collection("test").index_names().await.unwrap();
    names.sort();
    assert_eq!(names, vec!["idxtest".to_string(), "uidxtest".to_string()]);
}

#[tokio::test]
async fn reset_cleanup_content() {
    let model = CrudModel::builder("test")
        .column(Column::string("key").primary_key())
        .column(Column::int("sequence").auto_increment())
        .build()
        .unwrap();
    let db = get_db(&model).await;
    model
        .bind(&db)
        .add_all(vec![doc! {"key": "1"}, doc! {"key": "2"}])
        .await
        .unwrap();
    assert_eq!(model.bind(&db).get_all(doc! {}).await.unwrap().len(), 2);

    reset(&db, false).await.unwrap();
    assert!(model.bind(&db).get_all(doc! {}).await.unwrap().is_empty());
    let added = model.bind(&db).add(doc! {"key": "3"}).await.unwrap();
    assert_eq!(added.get_i64("sequence").unwrap(), 1);
}

#[tokio::test]
async fn load_requires_url_and_models() {
    let model = test_model();
    assert!(matches!(
        load("", &[&model]).await,
        Err(LoadError::NoDatabaseProvided)
    ));
    assert!(matches!(
        load("mongomock", &[]).await,
        Err(LoadError::NoRelatedModels)
    ));
}

#[tokio::test]
async fn health_details_success() {
    let model = test_model();
    let db = get_db(&model).await;

    let (status, details) = check(&db).await;
    assert_eq!(status, HealthStatus::Pass);
    let ping: &Document = details.get_document("mongomock:ping").unwrap();
    assert_eq!(ping.get_str("componentType").unwrap(), "datastore");
    assert_eq!(ping.get_str("status").unwrap(), "pass");
    assert_eq!(ping.get_document("observedValue").unwrap(), &doc! {"ok": 1.0});
    assert!(ping.get_str("time").is_ok());
}
