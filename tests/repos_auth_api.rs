mod common;

use actix_web::http::StatusCode;
use actix_web::{App, test};
use assert_json_diff::assert_json_include;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

use common::{bearer, seed_incident, seed_user, setup};
use guardian::web_server::configure_app;

#[actix_web::test]
async fn health_is_public() {
    let ctx = setup(json!({}), 1).await;
    let app = test::init_service(App::new().configure(configure_app(ctx.state.clone()))).await;

    let req = test::TestRequest::get().uri("/health").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body, json!({"status": "healthy", "service": "GitHub Guardian API"}));
}

#[actix_web::test]
async fn signup_login_and_installation() {
    let ctx = setup(json!({}), 1).await;
    let app = test::init_service(App::new().configure(configure_app(ctx.state.clone()))).await;

    let req = test::TestRequest::post()
        .uri("/api/auth/signup")
        .set_json(json!({"email": "Dev@Example.com", "password": "correct horse"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let user: Value = test::read_body_json(resp).await;
    assert_eq!(user["email"], "dev@example.com");
    assert!(user.get("password_hash").is_none());
    let user_id = user["id"].as_str().unwrap().to_string();

    let req = test::TestRequest::post()
        .uri("/api/auth/login")
        .set_json(json!({"email": "dev@example.com", "password": "correct horse"}))
        .to_request();
    let login: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(login["token_type"], "bearer");
    assert_eq!(login["user"], user);
    let token = login["access_token"].as_str().unwrap().to_string();

    let req = test::TestRequest::get()
        .uri(&format!("/api/auth/user/{user_id}"))
        .insert_header(bearer(&token))
        .to_request();
    let fetched: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(fetched, user);

    let app_status = |token: &str| {
        test::TestRequest::get()
            .uri(&format!("/api/auth/github/app-status/{user_id}"))
            .insert_header(bearer(token))
            .to_request()
    };
    let status: Value = test::call_and_read_body_json(&app, app_status(&token)).await;
    assert_eq!(
        status,
        json!({"installed": false, "installation_id": null, "token_expires_at": null})
    );

    let req = test::TestRequest::get()
        .uri(&format!(
            "/api/auth/github/callback?installation_id=4242&setup_action=install&state={user_id}"
        ))
        .insert_header(bearer(&token))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let status: Value = test::call_and_read_body_json(&app, app_status(&token)).await;
    assert_json_include!(
        actual: status,
        expected: json!({"installed": true, "installation_id": 4242})
    );
}

#[actix_web::test]
async fn signup_and_login_failures() {
    let ctx = setup(json!({}), 1).await;
    seed_user(&ctx, "taken@example.com").await;
    let app = test::init_service(App::new().configure(configure_app(ctx.state.clone()))).await;

    let cases = [
        (
            json!({"email": "TAKEN@example.com", "password": "long enough"}),
            StatusCode::CONFLICT,
        ),
        (
            json!({"email": "new@example.com", "password": "short"}),
            StatusCode::BAD_REQUEST,
        ),
        (
            json!({"email": "not-an-email", "password": "long enough"}),
            StatusCode::BAD_REQUEST,
        ),
    ];
    for (body, status) in cases {
        let req = test::TestRequest::post()
            .uri("/api/auth/signup")
            .set_json(body)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), status);
    }

    for (email, password) in [
        ("taken@example.com", "wrong password"),
        ("nobody@example.com", "password123"),
    ] {
        let req = test::TestRequest::post()
            .uri("/api/auth/login")
            .set_json(json!({"email": email, "password": password}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body, json!({"detail": "Invalid email or password"}));
    }

    // The seeded password is accepted.
    let req = test::TestRequest::post()
        .uri("/api/auth/login")
        .set_json(json!({"email": "taken@example.com", "password": "password123"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[actix_web::test]
async fn repository_crud() {
    let ctx = setup(json!({}), 1).await;
    let (user_id, token) = seed_user(&ctx, "dev@example.com").await;
    let app = test::init_service(App::new().configure(configure_app(ctx.state.clone()))).await;

    let create = |full_name: &str| {
        test::TestRequest::post()
            .uri(&format!("/api/repos?user_id={user_id}"))
            .insert_header(bearer(&token))
            .set_json(json!({"full_name": full_name}))
            .to_request()
    };

    let resp = test::call_service(&app, create(" octo/ci ")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let repo: Value = test::read_body_json(resp).await;
    assert_json_include!(
        actual: repo.clone(),
        expected: json!({"user_id": user_id, "full_name": "octo/ci", "is_active": true})
    );
    let repo_id = repo["id"].as_str().unwrap().to_string();

    let resp = test::call_service(&app, create("octo/ci")).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let resp = test::call_service(&app, create("not a repo")).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let req = test::TestRequest::get()
        .uri(&format!("/api/repos?user_id={user_id}"))
        .insert_header(bearer(&token))
        .to_request();
    let listed: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(listed, json!([repo.clone()]));

    let req = test::TestRequest::get()
        .uri(&format!("/api/repos/{repo_id}"))
        .insert_header(bearer(&token))
        .to_request();
    let fetched: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(fetched, repo);

    let req = test::TestRequest::delete()
        .uri(&format!("/api/repos/{repo_id}"))
        .insert_header(bearer(&token))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body, json!({"message": "Repository deleted successfully"}));

    let req = test::TestRequest::get()
        .uri(&format!("/api/repos/{repo_id}"))
        .insert_header(bearer(&token))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[actix_web::test]
async fn deleting_a_repository_removes_its_incidents_and_runs() {
    let ctx = setup(json!({}), 1).await;
    let (user_id, token) = seed_user(&ctx, "dev@example.com").await;
    let (repo, incident) = seed_incident(&ctx, &user_id).await;
    let app = test::init_service(App::new().configure(configure_app(ctx.state.clone()))).await;

    let req = test::TestRequest::post()
        .uri(&format!("/api/sandbox/{}", incident.id))
        .insert_header(bearer(&token))
        .set_json(json!({"snippet_executed": "echo ok"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let req = test::TestRequest::delete()
        .uri(&format!("/api/repos/{}", repo.id))
        .insert_header(bearer(&token))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    for table in ["incidents", "sandbox_runs"] {
        let remaining: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(ctx.pool.as_ref())
            .await
            .unwrap();
        assert_eq!(remaining, 0, "{table} should be empty");
    }
}

#[actix_web::test]
async fn foreign_user_id_is_forbidden() {
    let ctx = setup(json!({}), 1).await;
    let (owner_id, owner_token) = seed_user(&ctx, "owner@example.com").await;
    let (_, intruder_token) = seed_user(&ctx, "intruder@example.com").await;
    let (repo, _) = seed_incident(&ctx, &owner_id).await;
    let app = test::init_service(App::new().configure(configure_app(ctx.state.clone()))).await;

    for uri in [
        format!("/api/repos?user_id={owner_id}"),
        format!("/api/auth/user/{owner_id}"),
        format!("/api/auth/github/app-status/{owner_id}"),
    ] {
        let req = test::TestRequest::get()
            .uri(&uri)
            .insert_header(bearer(&intruder_token))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN, "{uri}");
    }

    let req = test::TestRequest::delete()
        .uri(&format!("/api/repos/{}", repo.id))
        .insert_header(bearer(&intruder_token))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    // Still there for its owner.
    let req = test::TestRequest::get()
        .uri(&format!("/api/repos/{}", repo.id))
        .insert_header(bearer(&owner_token))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
}
