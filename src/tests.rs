use std::sync::Arc;
use std::time::Duration;

use poem::http::StatusCode;
use poem::listener::TcpListener;
use poem::test::TestClient;
use poem::web::headers;
use poem::{Route, Server};
use serde_json::json;

use crate::data::api::{ApiClient, ApiDataAccess};
use crate::data::document::{DocumentDb, DocumentStore};
use crate::data::records::RecordDataAccess;
use crate::data::{Annotation, AnnotationKind, DataAccess, Filter, ImageData, Point, Project};
use crate::storage::backends::base64::Base64StorageAdapter;
use crate::storage::kv::MemoryKeyValueStore;
use crate::storage::StorageAdapter;

const PNG_IMAGE: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
const JPEG_IMAGE: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0, 0x10, b'J', b'F', b'I', b'F'];

fn fresh_access() -> Arc<dyn DataAccess> {
    Arc::new(RecordDataAccess::new(DocumentStore::new(Arc::new(
        DocumentDb::new(),
    ))))
}

fn fresh_storage() -> Arc<dyn StorageAdapter> {
    Arc::new(Base64StorageAdapter::new(Arc::new(MemoryKeyValueStore::new())))
}

fn setup_environment() -> TestClient<Route> {
    let app = crate::routes::build_app(fresh_storage(), fresh_access());
    TestClient::new(app)
}

fn project(id: &str) -> Project {
    Project {
        id: id.to_string(),
        name: format!("project {}", id),
        description: None,
        project_type: Some("detection".to_string()),
        status: None,
        settings: None,
        metadata: None,
        created_at: None,
        updated_at: None,
        last_modified: None,
        images: None,
    }
}

fn image(id: &str, project_id: &str) -> ImageData {
    ImageData {
        id: id.to_string(),
        project_id: project_id.to_string(),
        name: format!("{}.png", id),
        data: "data:image/png;base64,AAAA".to_string(),
        width: 640,
        height: 480,
        url: None,
        created_at: None,
        updated_at: None,
        annotations: None,
    }
}

fn annotation(id: &str, image_id: &str, color: &str) -> Annotation {
    Annotation {
        id: id.to_string(),
        image_id: image_id.to_string(),
        label_id: None,
        name: "car".to_string(),
        kind: AnnotationKind::Box,
        coordinates: vec![Point { x: 1.0, y: 2.0 }, Point { x: 3.0, y: 4.0 }],
        color: Some(color.to_string()),
        is_ai_generated: Some(false),
        created_at: None,
        updated_at: None,
    }
}

#[tokio::test]
async fn test_image_upload_retrieval_with_given_id() -> anyhow::Result<()> {
    let app = setup_environment();

    let res = app
        .put("/v1/images/cat")
        .body(PNG_IMAGE)
        .content_type("application/octet-stream".to_string())
        .typed_header(headers::ContentLength(PNG_IMAGE.len() as u64))
        .send()
        .await;

    res.assert_status(StatusCode::OK);
    let info = res.json().await;
    let info = info.value().object();
    info.get("image_id").assert_string("cat");
    info.get("size").assert_i64(PNG_IMAGE.len() as i64);
    info.get("checksum")
        .assert_i64(crate::utils::checksum(PNG_IMAGE) as i64);

    let res = app.get("/v1/images/cat").send().await;
    res.assert_status(StatusCode::OK);
    res.assert_content_type(&"image/png".to_string());
    res.assert_bytes(PNG_IMAGE).await;

    Ok(())
}

#[tokio::test]
async fn test_image_upload_with_generated_id_is_listed() -> anyhow::Result<()> {
    let app = setup_environment();

    let res = app
        .post("/v1/images")
        .body(JPEG_IMAGE)
        .content_type("application/octet-stream".to_string())
        .typed_header(headers::ContentLength(JPEG_IMAGE.len() as u64))
        .send()
        .await;

    res.assert_status(StatusCode::OK);
    let info = res.json().await;
    let image_id = info.value().object().get("image_id").string().to_string();

    let res = app.get(format!("/v1/images/{}", image_id)).send().await;
    res.assert_status(StatusCode::OK);
    res.assert_content_type(&"image/jpeg".to_string());

    let res = app.get("/v1/images").send().await;
    res.assert_status(StatusCode::OK);
    res.assert_json(json!([image_id])).await;

    Ok(())
}

#[tokio::test]
async fn test_missing_and_deleted_images() -> anyhow::Result<()> {
    let app = setup_environment();

    let res = app.get("/v1/images/missing").send().await;
    res.assert_status(StatusCode::NOT_FOUND);

    app.put("/v1/images/gone")
        .body(PNG_IMAGE)
        .content_type("application/octet-stream".to_string())
        .send()
        .await
        .assert_status(StatusCode::OK);

    let res = app.delete("/v1/images/gone").send().await;
    res.assert_status(StatusCode::NO_CONTENT);

    let res = app.get("/v1/images/gone").send().await;
    res.assert_status(StatusCode::NOT_FOUND);

    // Deleting twice is fine.
    let res = app.delete("/v1/images/gone").send().await;
    res.assert_status(StatusCode::NO_CONTENT);

    Ok(())
}

#[tokio::test]
async fn test_rest_project_lifecycle() -> anyhow::Result<()> {
    let app = setup_environment();

    let res = app
        .post("/api/projects")
        .body_json(&project("p1"))
        .send()
        .await;
    res.assert_status(StatusCode::CREATED);

    let res = app.get("/api/projects/p1").send().await;
    res.assert_status(StatusCode::OK);
    let body = res.json().await;
    body.value().object().get("type").assert_string("detection");

    let res = app
        .put("/api/projects/p1")
        .body_json(&json!({ "name": "renamed" }))
        .send()
        .await;
    res.assert_status(StatusCode::NO_CONTENT);

    let res = app.get("/api/projects/p1").send().await;
    res.json()
        .await
        .value()
        .object()
        .get("name")
        .assert_string("renamed");

    let res = app
        .put("/api/projects/nope")
        .body_json(&json!({ "name": "x" }))
        .send()
        .await;
    res.assert_status(StatusCode::NOT_FOUND);

    let res = app
        .put("/api/projects/p1")
        .body_json(&json!({ "notAColumn": 1 }))
        .send()
        .await;
    res.assert_status(StatusCode::BAD_REQUEST);

    let res = app.delete("/api/projects/p1").send().await;
    res.assert_status(StatusCode::NO_CONTENT);

    let res = app.get("/api/projects/p1").send().await;
    res.assert_status(StatusCode::NOT_FOUND);

    Ok(())
}

#[tokio::test]
async fn test_rest_images_and_annotations() -> anyhow::Result<()> {
    let app = setup_environment();

    app.post("/api/projects")
        .body_json(&project("p1"))
        .send()
        .await
        .assert_status(StatusCode::CREATED);

    for id in ["a", "b", "c"] {
        app.post("/api/images")
            .body_json(&image(id, "p1"))
            .send()
            .await
            .assert_status(StatusCode::CREATED);
    }

    let res = app
        .get("/api/projects/p1/images")
        .query("offset", &1)
        .query("limit", &1)
        .send()
        .await;
    res.assert_status(StatusCode::OK);
    let page = res.json().await;
    let page = page.value().array();
    assert_eq!(page.len(), 1);
    page.get(0).object().get("id").assert_string("b");

    let res = app.get("/api/images/b/next").send().await;
    res.assert_json(json!("c")).await;

    let res = app.get("/api/images/a/previous").send().await;
    res.assert_json(json!(null)).await;

    app.post("/api/annotations")
        .body_json(&annotation("x1", "a", "#ff0000"))
        .send()
        .await
        .assert_status(StatusCode::CREATED);
    app.post("/api/annotations")
        .body_json(&annotation("x2", "a", "#00ff00"))
        .send()
        .await
        .assert_status(StatusCode::CREATED);

    let res = app
        .get("/api/images/a/annotations")
        .query("color", &"#00ff00")
        .send()
        .await;
    let found = res.json().await;
    let found = found.value().array();
    assert_eq!(found.len(), 1);
    found.get(0).object().get("id").assert_string("x2");

    let res = app
        .get("/api/images/a/annotations")
        .query("isAIGenerated", &"false")
        .send()
        .await;
    assert_eq!(res.json().await.value().array().len(), 2);

    Ok(())
}

#[tokio::test]
async fn test_rest_settings_and_models() -> anyhow::Result<()> {
    let app = setup_environment();

    let res = app
        .put("/api/settings/theme")
        .body_json(&json!({ "value": "dark" }))
        .send()
        .await;
    res.assert_status(StatusCode::NO_CONTENT);

    let res = app.get("/api/settings/theme").send().await;
    res.assert_json(json!({ "key": "theme", "value": "dark" })).await;

    let res = app.get("/api/settings/font").send().await;
    res.assert_status(StatusCode::NOT_FOUND);

    app.post("/api/models")
        .body_json(&json!({ "id": "m1", "name": "yolo", "isCustom": true }))
        .send()
        .await
        .assert_status(StatusCode::CREATED);

    app.post("/api/models/m1/select")
        .send()
        .await
        .assert_status(StatusCode::NO_CONTENT);

    let res = app.get("/api/models/selected").send().await;
    res.json().await.value().object().get("id").assert_string("m1");

    app.delete("/api/models/m1")
        .send()
        .await
        .assert_status(StatusCode::NO_CONTENT);

    let res = app.get("/api/models/selected").send().await;
    res.assert_json(json!(null)).await;

    Ok(())
}

/// Serves a fresh app on a free local port and returns a client for it.
async fn spawn_api_server() -> anyhow::Result<(tokio::task::JoinHandle<std::io::Result<()>>, ApiDataAccess)> {
    let port = {
        let socket = std::net::TcpListener::bind("127.0.0.1:0")?;
        socket.local_addr()?.port()
    };

    let app = crate::routes::build_app(fresh_storage(), fresh_access());
    let server = tokio::spawn(
        Server::new(TcpListener::bind(format!("127.0.0.1:{}", port))).run(app),
    );

    let access = ApiDataAccess::new(ApiClient::new(format!("http://127.0.0.1:{}/api", port))?);

    let mut ready = false;
    for _ in 0..50 {
        if access.get_projects().await.is_ok() {
            ready = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(ready, "server did not come up");

    Ok((server, access))
}

/// `ApiDataAccess` against a live server backed by the document store.
#[tokio::test]
async fn test_api_data_access_against_rest_routes() -> anyhow::Result<()> {
    let (server, access) = spawn_api_server().await?;

    access.create_project(&project("p1")).await?;
    access.create_image(&image("i1", "p1")).await?;
    access.create_image(&image("i2", "p1")).await?;
    access
        .create_annotation(&annotation("x1", "i1", "#ff0000"))
        .await?;

    let with_images = access.get_project_with_images("p1").await?.unwrap();
    assert_eq!(with_images.images.map(|i| i.len()), Some(2));

    assert_eq!(access.get_next_image_id("i1").await?, Some("i2".to_string()));
    assert_eq!(access.get_next_image_id("i2").await?, None);
    assert!(access.get_project_by_id("nope").await?.is_none());

    let label = crate::data::Label {
        id: "l1".to_string(),
        name: "car".to_string(),
        description: None,
        category: None,
        is_ai_generated: None,
        project_id: Some("p1".to_string()),
        color: "#ff0000".to_string(),
        created_at: None,
        updated_at: None,
    };
    access.create_label(&label, &["x1".to_string()]).await?;

    let mut filter = Filter::new();
    filter.insert("labelId".to_string(), json!("l1"));
    let labelled = access.get_annotations_with_filter("i1", filter).await?;
    assert_eq!(labelled.len(), 1);

    let err = access
        .update_image("missing", serde_json::Map::new())
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    access.delete_project("p1").await?;
    assert!(access.get_images("p1").await?.is_empty());
    assert!(access.get_annotations("i1").await?.is_empty());

    server.abort();
    Ok(())
}

#[tokio::test]
async fn test_api_data_access_escapes_ids() -> anyhow::Result<()> {
    let (server, access) = spawn_api_server().await?;

    access.update_setting("brush", "4").await?;
    access.update_setting("brush#size", "12").await?;
    access.update_setting("brush size", "7").await?;
    access.update_setting("brush/size", "9").await?;

    for (key, expected) in [("brush", "4"), ("brush#size", "12"), ("brush size", "7"), ("brush/size", "9")] {
        let setting = access.get_setting(key).await?;
        assert_eq!(setting.map(|s| s.value), Some(expected.to_string()), "{}", key);
    }
    assert_eq!(access.get_settings().await?.len(), 4);

    for id in ["a/b", "with space", "tag#1", "50%"] {
        access.create_project(&project(id)).await?;
        let found = access.get_project_by_id(id).await?;
        assert_eq!(found.map(|p| p.id), Some(id.to_string()));

        let mut patch = serde_json::Map::new();
        patch.insert("name".to_string(), json!("renamed"));
        access.update_project(id, patch).await?;

        access.create_image(&image(&format!("{}-img", id), id)).await?;
        assert_eq!(access.get_images(id).await?.len(), 1);
    }
    assert!(access.get_project_by_id("a").await?.is_none());
    assert!(access.get_project_by_id("with").await?.is_none());

    access
        .create_annotation(&annotation("x/1", "a/b-img", "#ff0000"))
        .await?;
    let label = crate::data::Label {
        id: "car #1".to_string(),
        name: "car".to_string(),
        description: None,
        category: None,
        is_ai_generated: None,
        project_id: Some("a/b".to_string()),
        color: "#ff0000".to_string(),
        created_at: None,
        updated_at: None,
    };
    access.create_label(&label, &["x/1".to_string()]).await?;
    assert!(access.get_label_by_id("car #1").await?.is_some());
    assert!(access.get_label_by_id("car ").await?.is_none());

    let annotations = access.get_annotations("a/b-img").await?;
    assert_eq!(annotations.len(), 1);
    assert_eq!(annotations[0].label_id.as_deref(), Some("car #1"));

    access.delete_project("a/b").await?;
    assert!(access.get_project_by_id("a/b").await?.is_none());
    assert!(access.get_project_by_id("with space").await?.is_some());

    server.abort();
    Ok(())
}
