// The WebDav adapter over local directories.

use std::collections::HashMap;
use std::path::Path;

use futures_util::StreamExt;
use http::{Request, Response, StatusCode};

use dav_engine::body::Body;
use dav_engine::{WebDav, WebDavConfig};

fn vars(root: &Path) -> HashMap<String, String> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut vars = HashMap::new();
    vars.insert("http.vars.root".to_string(), root.to_string_lossy().into_owned());
    vars
}

async fn send(
    wd: &WebDav,
    vars: &HashMap<String, String>,
    method: &str,
    uri: &str,
    headers: &[(&str, &str)],
    body: &str,
) -> Response<Body> {
    let mut req = Request::builder().method(method).uri(uri);
    for (k, v) in headers {
        req = req.header(*k, *v);
    }
    wd.serve(req.body(Body::from(body)).unwrap(), vars).await
}

async fn body_string(res: Response<Body>) -> String {
    let mut body = res.into_body();
    let mut data = Vec::new();
    while let Some(chunk) = body.next().await {
        data.extend_from_slice(&chunk.unwrap());
    }
    String::from_utf8(data).unwrap()
}

// the hrefs of a multistatus body, in order.
fn hrefs(body: &str) -> Vec<String> {
    body.split("<D:href>")
        .skip(1)
        .filter_map(|s| s.split("</D:href>").next())
        .map(|s| s.to_string())
        .collect()
}

#[tokio::test]
async fn get_collection_is_propfind() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::create_dir(tmp.path().join("docs")).unwrap();
    std::fs::write(tmp.path().join("docs/b.txt"), "b").unwrap();
    std::fs::write(tmp.path().join("docs/a.txt"), "a").unwrap();
    std::fs::create_dir(tmp.path().join("docs/sub")).unwrap();
    std::fs::write(tmp.path().join("docs/sub/deep.txt"), "deep").unwrap();

    let wd = WebDav::provision(WebDavConfig::default());
    let vars = vars(tmp.path());

    let res = send(&wd, &vars, "GET", "/docs/", &[], "").await;
    assert_eq!(res.status(), StatusCode::MULTI_STATUS);
    let get = hrefs(&body_string(res).await);

    let res = send(&wd, &vars, "PROPFIND", "/docs/", &[("depth", "1")], "").await;
    assert_eq!(res.status(), StatusCode::MULTI_STATUS);
    let propfind = hrefs(&body_string(res).await);

    assert_eq!(get, propfind);
    assert_eq!(get, vec!["/docs/", "/docs/a.txt", "/docs/b.txt", "/docs/sub/"]);

    // an explicit Depth is kept.
    let res = send(&wd, &vars, "GET", "/docs/", &[("depth", "0")], "").await;
    assert_eq!(hrefs(&body_string(res).await), vec!["/docs/"]);
}

#[tokio::test]
async fn put_creates_parents() {
    let tmp = tempfile::tempdir().unwrap();
    let wd = WebDav::provision(WebDavConfig::default());
    let vars = vars(tmp.path());

    let res = send(&wd, &vars, "PUT", "/x/y.txt", &[], "payload").await;
    assert_eq!(res.status(), StatusCode::CREATED);
    assert!(tmp.path().join("x").is_dir());

    let res = send(&wd, &vars, "GET", "/x/y.txt", &[], "").await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body_string(res).await, "payload");

    // a file where a collection should be.
    let res = send(&wd, &vars, "PUT", "/x/y.txt/z.txt", &[], "nope").await;
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_string(res).await, "Error creating directories\n");
}

#[tokio::test]
async fn head_has_no_body() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("f.txt"), "0123456789").unwrap();
    let wd = WebDav::provision(WebDavConfig::default());
    let vars = vars(tmp.path());

    let get = send(&wd, &vars, "GET", "/f.txt", &[], "").await;
    let head = send(&wd, &vars, "HEAD", "/f.txt", &[], "").await;
    assert_eq!(get.status(), head.status());
    for h in ["content-length", "etag", "last-modified", "content-type"] {
        assert_eq!(get.headers().get(h), head.headers().get(h), "{h}");
    }
    assert_eq!(body_string(get).await, "0123456789");
    assert_eq!(body_string(head).await, "");
}

#[tokio::test]
async fn locks_outlive_a_request() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("f.txt"), "data").unwrap();
    let wd = WebDav::provision(WebDavConfig::default());
    let vars = vars(tmp.path());

    let lockinfo = r#"<?xml version="1.0" encoding="utf-8"?>
<D:lockinfo xmlns:D="DAV:">
  <D:lockscope><D:exclusive/></D:lockscope>
  <D:locktype><D:write/></D:locktype>
</D:lockinfo>"#;
    let res = send(&wd, &vars, "LOCK", "/f.txt", &[], lockinfo).await;
    assert_eq!(res.status(), StatusCode::OK);
    let token = res.headers()["lock-token"].to_str().unwrap().to_string();

    let res = send(&wd, &vars, "DELETE", "/f.txt", &[], "").await;
    assert_eq!(res.status(), StatusCode::LOCKED);

    // a clone shares the lock table.
    let wd2 = wd.clone();
    let if_hdr = format!("({token})");
    let res = send(&wd2, &vars, "DELETE", "/f.txt", &[("if", if_hdr.as_str())], "").await;
    assert_eq!(res.status(), StatusCode::NO_CONTENT);
    assert!(!tmp.path().join("f.txt").exists());
}

#[tokio::test]
async fn root_per_request() {
    let one = tempfile::tempdir().unwrap();
    let two = tempfile::tempdir().unwrap();
    std::fs::write(one.path().join("f.txt"), "one").unwrap();
    std::fs::write(two.path().join("f.txt"), "two").unwrap();

    let config: WebDavConfig = serde_json::from_str(r#"{ "prefix": "/files" }"#).unwrap();
    let wd = WebDav::provision(config);

    let res = send(&wd, &vars(one.path()), "GET", "/files/f.txt", &[], "").await;
    assert_eq!(body_string(res).await, "one");
    let res = send(&wd, &vars(two.path()), "GET", "/files/f.txt", &[], "").await;
    assert_eq!(body_string(res).await, "two");

    let res = send(&wd, &vars(one.path()), "GET", "/f.txt", &[], "").await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    // locks and dead properties stay with their root.
    let lockinfo = r#"<?xml version="1.0" encoding="utf-8"?>
<D:lockinfo xmlns:D="DAV:">
  <D:lockscope><D:exclusive/></D:lockscope>
  <D:locktype><D:write/></D:locktype>
</D:lockinfo>"#;
    let res = send(&wd, &vars(one.path()), "LOCK", "/files/f.txt", &[], lockinfo).await;
    assert_eq!(res.status(), StatusCode::OK);
    let res = send(&wd, &vars(one.path()), "PUT", "/files/f.txt", &[], "x").await;
    assert_eq!(res.status(), StatusCode::LOCKED);
    let res = send(&wd, &vars(two.path()), "PUT", "/files/f.txt", &[], "2").await;
    assert_eq!(res.status(), StatusCode::NO_CONTENT);

    let set = r#"<?xml version="1.0" encoding="utf-8"?>
<D:propertyupdate xmlns:D="DAV:" xmlns:Z="urn:example:">
  <D:set><D:prop><Z:secret>one</Z:secret></D:prop></D:set>
</D:propertyupdate>"#;
    let res = send(&wd, &vars(two.path()), "PROPPATCH", "/files/f.txt", &[], set).await;
    assert_eq!(res.status(), StatusCode::MULTI_STATUS);
    let res = send(&wd, &vars(two.path()), "PROPFIND", "/files/f.txt", &[("depth", "0")], "").await;
    assert!(body_string(res).await.contains("secret"));
    let res = send(&wd, &vars(one.path()), "PROPFIND", "/files/f.txt", &[("depth", "0")], "").await;
    assert!(!body_string(res).await.contains("secret"));
}

#[tokio::test]
async fn parents_respect_locks_and_preconditions() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::create_dir(tmp.path().join("locked")).unwrap();
    let wd = WebDav::provision(WebDavConfig::default());
    let vars = vars(tmp.path());

    let lockinfo = r#"<?xml version="1.0" encoding="utf-8"?>
<D:lockinfo xmlns:D="DAV:">
  <D:lockscope><D:exclusive/></D:lockscope>
  <D:locktype><D:write/></D:locktype>
</D:lockinfo>"#;
    let res = send(&wd, &vars, "LOCK", "/locked/", &[("depth", "infinity")], lockinfo).await;
    assert_eq!(res.status(), StatusCode::OK);
    let token = res.headers()["lock-token"].to_str().unwrap().to_string();

    // no token: nothing is created inside the locked collection.
    let res = send(&wd, &vars, "PUT", "/locked/new/sub/f.txt", &[], "data").await;
    assert_eq!(res.status(), StatusCode::LOCKED);
    assert!(!tmp.path().join("locked/new").exists());

    let if_hdr = format!("({token})");
    let res = send(&wd, &vars, "PUT", "/locked/new/sub/f.txt", &[("if", if_hdr.as_str())], "data").await;
    assert_eq!(res.status(), StatusCode::CREATED);
    assert!(tmp.path().join("locked/new/sub/f.txt").is_file());

    // a failed precondition leaves no directories behind.
    let res = send(&wd, &vars, "PUT", "/other/dir/f.txt", &[("if-match", "\"nope\"")], "data").await;
    assert_eq!(res.status(), StatusCode::PRECONDITION_FAILED);
    assert!(!tmp.path().join("other").exists());
}
