use torii_domain_srv::*;

fn sha256_hex(s: &str) -> String {
    use sha2::Digest;
    sha2::Sha256::digest(s.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

struct Resp {
    status: u16,
    body: Vec<u8>,
}

impl Resp {
    fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap()
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

/// Drive a blocking http request off the async test runtime.
async fn request(
    method: &'static str,
    url: String,
    auth: Option<(String, String)>,
    body: Option<Vec<u8>>,
) -> Resp {
    tokio::task::spawn_blocking(move || {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .build()
            .into();

        let auth_header = auth.map(|(user, pass)| {
            use base64::prelude::*;
            format!(
                "Basic {}",
                BASE64_STANDARD.encode(format!("{user}:{pass}"))
            )
        });

        let result = match method {
            "GET" | "DELETE" => {
                let mut req = if method == "GET" {
                    agent.get(&url)
                } else {
                    agent.delete(&url)
                };
                if let Some(auth) = auth_header.as_ref() {
                    req = req.header("Authorization", auth);
                }
                req.call()
            }
            _ => {
                let mut req = agent.post(&url);
                if let Some(auth) = auth_header.as_ref() {
                    req = req.header("Authorization", auth);
                }
                match body {
                    Some(body) => {
                        req.header("Content-Type", "application/json").send(&body[..])
                    }
                    None => req.send_empty(),
                }
            }
        };

        let mut resp = result.expect("transport-level http failure");
        Resp {
            status: resp.status().as_u16(),
            body: resp.body_mut().read_to_vec().unwrap_or_default(),
        }
    })
    .await
    .unwrap()
}

async fn start_srv(dir: &std::path::Path) -> (DomainSrv, String) {
    let srv = DomainSrv::start(Config::testing(dir))
        .await
        .expect("server should start");
    let base = format!("http://{}", srv.http_addr());
    (srv, base)
}

#[tokio::test(flavor = "multi_thread")]
async fn id_is_open_but_admin_routes_require_basic_auth() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("settings.json"),
        serde_json::to_vec(&serde_json::json!({
            "security": {
                "http_username": "admin",
                "http_password": sha256_hex("hunter2"),
            }
        }))
        .unwrap(),
    )
    .unwrap();

    let (srv, base) = start_srv(dir.path()).await;

    // /id answers without credentials
    let id = request("GET", format!("{base}/id"), None, None).await;
    assert_eq!(200, id.status);
    assert_eq!(srv.id().to_string(), id.text());

    // everything else wants basic auth
    let denied =
        request("GET", format!("{base}/nodes.json"), None, None).await;
    assert_eq!(401, denied.status);

    let wrong = request(
        "GET",
        format!("{base}/nodes.json"),
        Some(("admin".into(), "wrong".into())),
        None,
    )
    .await;
    assert_eq!(401, wrong.status);

    let ok = request(
        "GET",
        format!("{base}/nodes.json"),
        Some(("admin".into(), "hunter2".into())),
        None,
    )
    .await;
    assert_eq!(200, ok.status);
    assert_eq!(serde_json::json!({ "nodes": [] }), ok.json());
}

#[tokio::test(flavor = "multi_thread")]
async fn open_deployment_serves_the_admin_surface() {
    let dir = tempfile::tempdir().unwrap();
    let (_srv, base) = start_srv(dir.path()).await;

    let nodes =
        request("GET", format!("{base}/nodes.json"), None, None).await;
    assert_eq!(200, nodes.status);

    let assignments = request(
        "GET",
        format!("{base}/assignments.json"),
        None,
        None,
    )
    .await;
    assert_eq!(200, assignments.status);
    // the default static worker set is queued
    assert!(!assignments.json()["queued"].as_array().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn settings_update_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let (_srv, base) = start_srv(dir.path()).await;

    let update = request(
        "POST",
        format!("{base}/settings.json"),
        None,
        Some(
            serde_json::to_vec(&serde_json::json!({
                "descriptors": { "world_name": "rooftop" }
            }))
            .unwrap(),
        ),
    )
    .await;
    assert_eq!(200, update.status);

    let settings =
        request("GET", format!("{base}/settings.json"), None, None).await;
    assert_eq!(
        serde_json::json!("rooftop"),
        settings.json()["descriptors"]["world_name"],
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn backups_can_be_created_listed_recovered_and_deleted() {
    let dir = tempfile::tempdir().unwrap();
    let (_srv, base) = start_srv(dir.path()).await;

    let created = request(
        "POST",
        format!("{base}/api/backups?name=test"),
        None,
        None,
    )
    .await;
    assert_eq!(200, created.status);
    let id = created.json()["id"].as_str().unwrap().to_string();

    let listed =
        request("GET", format!("{base}/api/backups"), None, None).await;
    let backups = listed.json();
    assert!(backups["backups"]
        .as_array()
        .unwrap()
        .iter()
        .any(|b| b["id"] == serde_json::json!(id)));

    let recovered = request(
        "POST",
        format!("{base}/api/backups/recover/{id}"),
        None,
        None,
    )
    .await;
    assert_eq!(200, recovered.status);

    let deleted = request(
        "DELETE",
        format!("{base}/api/backups/{id}"),
        None,
        None,
    )
    .await;
    assert_eq!(200, deleted.status);
    let listed =
        request("GET", format!("{base}/api/backups"), None, None).await;
    assert!(listed.json()["backups"].as_array().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn content_upload_swaps_the_scene_atomically() {
    let dir = tempfile::tempdir().unwrap();
    let (_srv, base) = start_srv(dir.path()).await;

    let uploaded = request(
        "POST",
        format!("{base}/content/upload?filename=models.json"),
        None,
        Some(br#"{"entities":["uploaded"]}"#.to_vec()),
    )
    .await;
    assert_eq!(200, uploaded.status);

    // the swap landed on disk and left no staging file behind
    let entities =
        torii_backup::EntitiesFile::new(dir.path().join("entities"));
    let (_, body) = entities.read().unwrap().unwrap();
    assert_eq!(r#"{"entities":["uploaded"]}"#, body);
    assert!(!entities.replace_path().exists());

    let rejected = request(
        "POST",
        format!("{base}/content/upload?filename=models.json"),
        None,
        Some(b"{ not json".to_vec()),
    )
    .await;
    assert_eq!(400, rejected.status);

    // the bad upload left the good scene alone
    let (_, body) = entities.read().unwrap().unwrap();
    assert_eq!(r#"{"entities":["uploaded"]}"#, body);
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_route_requests_the_reboot_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let (srv, base) = start_srv(dir.path()).await;

    let restarted =
        request("GET", format!("{base}/restart"), None, None).await;
    assert_eq!(200, restarted.status);

    let code = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        srv.wait_for_exit(),
    )
    .await
    .expect("exit code should arrive");
    assert_eq!(EXIT_CODE_REBOOT, code);
}
