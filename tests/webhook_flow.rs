use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use hmac::{Hmac, Mac};
use sea_orm::ActiveValue::NotSet;
use sea_orm::{ActiveModelTrait, Set};
use serde_json::json;
use sha2::Sha256;
use tower::ServiceExt;
use uuid::Uuid;

use storefront_api::{
    config::AppConfig,
    db::{create_orm_conn, create_pool, run_migrations},
    dto::{
        cart::AddToCartRequest,
        checkout::{CheckoutRequest, CheckoutSessionDto, ShippingDetails},
    },
    entity::products::ActiveModel as ProductActive,
    gateway::GatewayClient,
    models::Identity,
    routes::create_api_router,
    services::{cart_service, checkout_service, order_service, payment_service},
    state::AppState,
};

const WEBHOOK_SECRET: &str = "whsec_test123secret456";

async fn setup_state() -> anyhow::Result<Option<AppState>> {
    let database_url =
        match std::env::var("TEST_DATABASE_URL").or_else(|_| std::env::var("DATABASE_URL")) {
            Ok(url) => url,
            Err(_) => {
                eprintln!(
                    "Skipping test: set TEST_DATABASE_URL or DATABASE_URL to run webhook flow tests."
                );
                return Ok(None);
            }
        };

    let pool = create_pool(&database_url).await?;
    run_migrations(&pool).await?;
    let orm = create_orm_conn(&database_url).await?;

    let config = AppConfig {
        database_url,
        host: "127.0.0.1".to_string(),
        port: 0,
        public_base_url: "http://localhost:3000".to_string(),
        gateway_url: None,
        gateway_timeout_secs: 5,
        webhook_secret: WEBHOOK_SECRET.to_string(),
        vat_permille: 75,
        shipping_flat_cents: 0,
    };
    let gateway = GatewayClient::from_config(&config)?;
    Ok(Some(AppState::new(pool, orm, gateway, config)))
}

fn app(state: AppState) -> Router {
    Router::new().nest("/api", create_api_router()).with_state(state)
}

fn sign(payload: &[u8], secret: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac key");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

fn webhook_request(payload: &[u8], signature: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/api/webhooks/payment")
        .header("content-type", "application/json");
    if let Some(signature) = signature {
        builder = builder.header("x-gateway-signature", signature);
    }
    builder.body(Body::from(payload.to_vec())).unwrap()
}

async fn seed_product(state: &AppState, price: i64, stock: i32) -> anyhow::Result<Uuid> {
    let product = ProductActive {
        id: Set(Uuid::new_v4()),
        name: Set(format!("Webhook Widget {}", Uuid::new_v4())),
        description: Set(None),
        price: Set(price),
        sale_price: Set(None),
        min_purchase: Set(1),
        max_purchase: Set(20),
        stock: Set(stock),
        available: Set(true),
        created_at: NotSet,
    }
    .insert(&state.orm)
    .await?;
    Ok(product.id)
}

fn shipping() -> CheckoutRequest {
    CheckoutRequest {
        shipping: ShippingDetails {
            recipient_name: "Ada Obi".into(),
            phone: "+2348000000000".into(),
            address: "12 Allen Avenue".into(),
            city: "Lagos".into(),
            state: "LA".into(),
            postal_code: "100001".into(),
            country: "NG".into(),
        },
    }
}

async fn initiate_checkout(state: &AppState, identity: &Identity) -> anyhow::Result<CheckoutSessionDto> {
    let product_id = seed_product(state, 1999, 10).await?;
    cart_service::add_item(
        state,
        identity,
        AddToCartRequest {
            product_id,
            quantity: 2,
        },
    )
    .await?;
    let session = checkout_service::initiate(state, identity, shipping()).await?;
    Ok(session.data.unwrap())
}

async fn order_count(state: &AppState, payment_id: Uuid) -> anyhow::Result<i64> {
    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM orders WHERE payment_id = $1")
        .bind(payment_id)
        .fetch_one(&state.pool)
        .await?;
    Ok(count.0)
}

#[tokio::test]
async fn webhook_materializes_order() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let identity = Identity::User(Uuid::new_v4());
    let session = initiate_checkout(&state, &identity).await?;

    let payload = serde_json::to_vec(&json!({
        "type": "checkout.session.completed",
        "data": {
            "id": format!("sandbox_{}", session.payment_id),
            "metadata": {
                "payment_id": session.payment_id,
                "basket_no": session.basket_no,
            }
        }
    }))?;
    let signature = sign(&payload, WEBHOOK_SECRET);

    let response = app(state.clone())
        .oneshot(webhook_request(&payload, Some(&signature)))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    assert_eq!(order_count(&state, session.payment_id).await?, 1);
    let payment = payment_service::get(&state, session.payment_id).await?;
    assert_eq!(payment.status, "paid");
    Ok(())
}

#[tokio::test]
async fn webhook_rejects_bad_signature_without_side_effects() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let identity = Identity::User(Uuid::new_v4());
    let session = initiate_checkout(&state, &identity).await?;

    let payload = serde_json::to_vec(&json!({
        "type": "checkout.session.completed",
        "data": { "metadata": { "payment_id": session.payment_id } }
    }))?;
    let forged = sign(&payload, "wrong_secret");

    let response = app(state.clone())
        .oneshot(webhook_request(&payload, Some(&forged)))
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Nothing was processed.
    assert_eq!(order_count(&state, session.payment_id).await?, 0);
    let payment = payment_service::get(&state, session.payment_id).await?;
    assert_eq!(payment.status, "initiated");
    Ok(())
}

#[tokio::test]
async fn webhook_missing_signature_rejected() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let payload = serde_json::to_vec(&json!({ "type": "checkout.session.completed" }))?;
    let response = app(state).oneshot(webhook_request(&payload, None)).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn webhook_acknowledges_unknown_payment() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let payload = serde_json::to_vec(&json!({
        "type": "checkout.session.completed",
        "data": { "metadata": { "payment_id": Uuid::new_v4() } }
    }))?;
    let signature = sign(&payload, WEBHOOK_SECRET);

    // A record that cannot be found is not something retrying fixes;
    // acknowledge so the gateway stops redelivering.
    let response = app(state).oneshot(webhook_request(&payload, Some(&signature))).await?;
    assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn webhook_redelivery_is_idempotent() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let identity = Identity::User(Uuid::new_v4());
    let session = initiate_checkout(&state, &identity).await?;

    let payload = serde_json::to_vec(&json!({
        "type": "payment_intent.succeeded",
        "data": {
            "id": format!("sandbox_{}", session.payment_id),
            "metadata": { "payment_id": session.payment_id }
        }
    }))?;
    let signature = sign(&payload, WEBHOOK_SECRET);

    for _ in 0..3 {
        let response = app(state.clone())
            .oneshot(webhook_request(&payload, Some(&signature)))
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
    }

    assert_eq!(order_count(&state, session.payment_id).await?, 1);
    Ok(())
}

#[tokio::test]
async fn webhook_races_redirect_path_to_a_single_order() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let identity = Identity::User(Uuid::new_v4());
    let session = initiate_checkout(&state, &identity).await?;

    let payload = serde_json::to_vec(&json!({
        "type": "checkout.session.completed",
        "data": { "metadata": { "payment_id": session.payment_id } }
    }))?;
    let signature = sign(&payload, WEBHOOK_SECRET);

    let webhook = app(state.clone()).oneshot(webhook_request(&payload, Some(&signature)));
    let redirect = order_service::materialize(&state, session.payment_id);

    let (webhook_response, redirect_order) = tokio::join!(webhook, redirect);
    assert_eq!(webhook_response?.status(), StatusCode::OK);
    let redirect_order = redirect_order?;

    assert_eq!(order_count(&state, session.payment_id).await?, 1);

    let existing = order_service::materialize(&state, session.payment_id).await?;
    assert_eq!(existing.order.order_no, redirect_order.order.order_no);
    Ok(())
}

#[tokio::test]
async fn failure_event_marks_payment_failed() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let identity = Identity::User(Uuid::new_v4());
    let session = initiate_checkout(&state, &identity).await?;

    let payload = serde_json::to_vec(&json!({
        "type": "payment_intent.payment_failed",
        "data": {
            "id": format!("sandbox_{}", session.payment_id),
            "metadata": { "payment_id": session.payment_id }
        }
    }))?;
    let signature = sign(&payload, WEBHOOK_SECRET);

    let response = app(state.clone())
        .oneshot(webhook_request(&payload, Some(&signature)))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let payment = payment_service::get(&state, session.payment_id).await?;
    assert_eq!(payment.status, "failed");

    // A failed record never turns into an order, even if a success event
    // arrives afterwards.
    let success = serde_json::to_vec(&json!({
        "type": "payment_intent.succeeded",
        "data": { "metadata": { "payment_id": session.payment_id } }
    }))?;
    let signature = sign(&success, WEBHOOK_SECRET);
    let response = app(state.clone())
        .oneshot(webhook_request(&success, Some(&signature)))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(order_count(&state, session.payment_id).await?, 0);
    Ok(())
}
