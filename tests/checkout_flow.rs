use sea_orm::ActiveValue::NotSet;
use sea_orm::{ActiveModelTrait, Set};
use uuid::Uuid;

use storefront_api::{
    config::AppConfig,
    db::{create_orm_conn, create_pool, run_migrations},
    dto::{
        cart::AddToCartRequest,
        checkout::{BuyNowRequest, CheckoutRequest, ShippingDetails},
        orders::UpdateOrderStatusRequest,
        products::StockAdjustRequest,
    },
    entity::products::ActiveModel as ProductActive,
    error::AppError,
    gateway::GatewayClient,
    middleware::identity::AuthUser,
    models::Identity,
    services::{admin_service, cart_service, checkout_service, order_service, payment_service},
    state::AppState,
};

// Integration flow tests run against a real database and skip when none is
// configured. Each test seeds its own products and principals, so tests can
// run concurrently against a shared database.

async fn setup_state() -> anyhow::Result<Option<AppState>> {
    let database_url =
        match std::env::var("TEST_DATABASE_URL").or_else(|_| std::env::var("DATABASE_URL")) {
            Ok(url) => url,
            Err(_) => {
                eprintln!(
                    "Skipping test: set TEST_DATABASE_URL or DATABASE_URL to run integration flow tests."
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
        webhook_secret: "whsec_test123secret456".to_string(),
        vat_permille: 75,
        shipping_flat_cents: 0,
    };
    let gateway = GatewayClient::from_config(&config)?;
    Ok(Some(AppState::new(pool, orm, gateway, config)))
}

async fn seed_product(
    state: &AppState,
    price: i64,
    sale_price: Option<i64>,
    min_purchase: i32,
    max_purchase: i32,
    stock: i32,
) -> anyhow::Result<Uuid> {
    let product = ProductActive {
        id: Set(Uuid::new_v4()),
        name: Set(format!("Test Widget {}", Uuid::new_v4())),
        description: Set(Some("A product for testing".into())),
        price: Set(price),
        sale_price: Set(sale_price),
        min_purchase: Set(min_purchase),
        max_purchase: Set(max_purchase),
        stock: Set(stock),
        available: Set(true),
        created_at: NotSet,
    }
    .insert(&state.orm)
    .await?;
    Ok(product.id)
}

fn guest() -> Identity {
    Identity::Guest(format!("sess-{}", Uuid::new_v4()))
}

fn user() -> Identity {
    Identity::User(Uuid::new_v4())
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

async fn stock_of(state: &AppState, product_id: Uuid) -> anyhow::Result<i32> {
    let row: (i32,) = sqlx::query_as("SELECT stock FROM products WHERE id = $1")
        .bind(product_id)
        .fetch_one(&state.pool)
        .await?;
    Ok(row.0)
}

#[tokio::test]
async fn add_rejects_stock_overflow_leaving_cart_unchanged() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let product_id = seed_product(&state, 1999, None, 1, 20, 10).await?;
    let identity = user();

    // Asking for more than is on hand is rejected outright.
    let err = cart_service::add_item(
        &state,
        &identity,
        AddToCartRequest {
            product_id,
            quantity: 15,
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::StockExceeded { available: 10 }));

    let cart = cart_service::list_cart(&state, &identity).await?;
    assert!(cart.data.unwrap().items.is_empty());

    // A partial fill sticks; pushing past stock afterwards leaves it alone.
    cart_service::add_item(
        &state,
        &identity,
        AddToCartRequest {
            product_id,
            quantity: 5,
        },
    )
    .await?;
    let err = cart_service::add_item(
        &state,
        &identity,
        AddToCartRequest {
            product_id,
            quantity: 10,
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::StockExceeded { available: 10 }));

    let cart = cart_service::list_cart(&state, &identity).await?;
    let items = cart.data.unwrap().items;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].quantity, 5);
    Ok(())
}

#[tokio::test]
async fn add_accumulates_and_clamps_to_purchase_max() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let product_id = seed_product(&state, 1999, None, 1, 4, 10).await?;
    let identity = user();

    cart_service::add_item(
        &state,
        &identity,
        AddToCartRequest {
            product_id,
            quantity: 3,
        },
    )
    .await?;
    // 3 + 3 overshoots the per-order max of 4 and is clamped silently.
    let resp = cart_service::add_item(
        &state,
        &identity,
        AddToCartRequest {
            product_id,
            quantity: 3,
        },
    )
    .await?;
    assert_eq!(resp.data.unwrap().quantity, 4);
    Ok(())
}

#[tokio::test]
async fn merge_sums_and_caps_at_max_purchase() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let shared = seed_product(&state, 1999, None, 1, 3, 10).await?;
    let guest_only = seed_product(&state, 899, None, 1, 20, 10).await?;

    let user_id = Uuid::new_v4();
    let user_identity = Identity::User(user_id);
    let guest_identity = guest();
    let session_key = guest_identity.session_key().unwrap().to_string();

    cart_service::add_item(
        &state,
        &guest_identity,
        AddToCartRequest {
            product_id: shared,
            quantity: 2,
        },
    )
    .await?;
    cart_service::add_item(
        &state,
        &guest_identity,
        AddToCartRequest {
            product_id: guest_only,
            quantity: 2,
        },
    )
    .await?;
    cart_service::add_item(
        &state,
        &user_identity,
        AddToCartRequest {
            product_id: shared,
            quantity: 2,
        },
    )
    .await?;

    let merged = cart_service::merge_guest_into_user(&state, &session_key, user_id).await?;
    assert_eq!(merged, 2);

    // Guest cart is gone.
    let guest_cart = cart_service::list_cart(&state, &guest_identity).await?;
    assert!(guest_cart.data.unwrap().items.is_empty());

    // 2 + 2 capped at the purchase max of 3; the guest-only row was re-keyed
    // with its quantity preserved.
    let user_cart = cart_service::list_cart(&state, &user_identity).await?;
    let items = user_cart.data.unwrap().items;
    assert_eq!(items.len(), 2);
    let shared_qty = items
        .iter()
        .find(|line| line.product.id == shared)
        .unwrap()
        .quantity;
    let guest_only_qty = items
        .iter()
        .find(|line| line.product.id == guest_only)
        .unwrap()
        .quantity;
    assert_eq!(shared_qty, 3);
    assert_eq!(guest_only_qty, 2);
    Ok(())
}

#[tokio::test]
async fn checkout_math_and_materialization() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let product_id = seed_product(&state, 1999, None, 1, 20, 10).await?;
    let identity = user();

    cart_service::add_item(
        &state,
        &identity,
        AddToCartRequest {
            product_id,
            quantity: 3,
        },
    )
    .await?;

    let session = checkout_service::initiate(&state, &identity, shipping()).await?;
    let session = session.data.unwrap();
    // 3 x $19.99 = $59.97 subtotal, 7.5% VAT rounds to $4.50, total $64.47.
    assert_eq!(session.amount, 6447);
    assert!(session.redirect_url.contains(&session.payment_id.to_string()));

    let order = order_service::materialize(&state, session.payment_id).await?;
    assert_eq!(order.order.subtotal, 5997);
    assert_eq!(order.order.tax, 450);
    assert_eq!(order.order.total, 6447);
    assert_eq!(order.order.status, "processing");
    assert_eq!(order.items.len(), 1);
    assert_eq!(order.items[0].quantity, 3);
    assert_eq!(order.items[0].unit_price, 1999);

    // The cart is retired and stock is drawn down.
    let cart = cart_service::list_cart(&state, &identity).await?;
    assert!(cart.data.unwrap().items.is_empty());
    assert_eq!(stock_of(&state, product_id).await?, 7);

    // The ledger reflects the paid transition.
    let payment = payment_service::get(&state, session.payment_id).await?;
    assert_eq!(payment.status, "paid");
    assert!(payment.paid_at.is_some());
    Ok(())
}

#[tokio::test]
async fn materialize_is_idempotent_and_race_safe() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let product_id = seed_product(&state, 1999, None, 1, 20, 10).await?;
    let identity = user();

    cart_service::add_item(
        &state,
        &identity,
        AddToCartRequest {
            product_id,
            quantity: 2,
        },
    )
    .await?;
    let session = checkout_service::initiate(&state, &identity, shipping()).await?;
    let payment_id = session.data.unwrap().payment_id;

    // The redirect path and the webhook race each other for the same
    // payment; both must come back with the same order.
    let (a, b) = tokio::join!(
        order_service::materialize(&state, payment_id),
        order_service::materialize(&state, payment_id),
    );
    let a = a?;
    let b = b?;
    assert_eq!(a.order.id, b.order.id);
    assert_eq!(a.order.order_no, b.order.order_no);

    // And any later replay is a no-op returning the same order.
    let c = order_service::materialize(&state, payment_id).await?;
    assert_eq!(c.order.id, a.order.id);

    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM orders WHERE payment_id = $1")
        .bind(payment_id)
        .fetch_one(&state.pool)
        .await?;
    assert_eq!(count.0, 1);

    // Stock was drawn down exactly once.
    assert_eq!(stock_of(&state, product_id).await?, 8);
    Ok(())
}

#[tokio::test]
async fn mark_paid_flips_exactly_once() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let identity = user();
    let payment = payment_service::open(
        &state,
        &identity,
        Uuid::new_v4(),
        6447,
        0,
        &shipping().shipping,
    )
    .await?;

    assert!(payment_service::mark_paid(&state.orm, payment.id).await?);
    assert!(!payment_service::mark_paid(&state.orm, payment.id).await?);
    assert!(!payment_service::mark_paid(&state.orm, payment.id).await?);

    let missing = payment_service::mark_paid(&state.orm, Uuid::new_v4()).await;
    assert!(matches!(missing, Err(AppError::PaymentRecordNotFound)));
    Ok(())
}

#[tokio::test]
async fn gateway_reference_attach_is_idempotent() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let identity = user();
    let payment = payment_service::open(
        &state,
        &identity,
        Uuid::new_v4(),
        1000,
        0,
        &shipping().shipping,
    )
    .await?;

    payment_service::attach_gateway_reference(&state, payment.id, "sess_abc").await?;
    payment_service::attach_gateway_reference(&state, payment.id, "sess_abc").await?;
    // A different value is refused; the first reference wins.
    payment_service::attach_gateway_reference(&state, payment.id, "sess_other").await?;

    let record = payment_service::get(&state, payment.id).await?;
    assert_eq!(record.gateway_reference.as_deref(), Some("sess_abc"));
    Ok(())
}

#[tokio::test]
async fn empty_cart_checkout_rejected() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let err = checkout_service::initiate(&state, &user(), shipping())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::EmptyCart));
    Ok(())
}

#[tokio::test]
async fn buy_now_scopes_checkout_to_its_product() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let kept = seed_product(&state, 899, None, 1, 20, 10).await?;
    let bought = seed_product(&state, 1999, None, 1, 20, 10).await?;
    let identity = user();

    cart_service::add_item(
        &state,
        &identity,
        AddToCartRequest {
            product_id: kept,
            quantity: 2,
        },
    )
    .await?;
    checkout_service::buy_now(
        &state,
        &identity,
        BuyNowRequest {
            product_id: bought,
            quantity: Some(1),
        },
    )
    .await?;

    let session = checkout_service::initiate(&state, &identity, shipping()).await?;
    let session = session.data.unwrap();
    // Only the buy-now product is in the attempt: $19.99 + 7.5% VAT.
    assert_eq!(session.amount, 1999 + 150);

    let order = order_service::materialize(&state, session.payment_id).await?;
    assert_eq!(order.items.len(), 1);
    assert_eq!(order.items[0].product_id, bought);

    // The rest of the cart survives untouched.
    let cart = cart_service::list_cart(&state, &identity).await?;
    let items = cart.data.unwrap().items;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].product.id, kept);
    assert_eq!(items[0].quantity, 2);
    Ok(())
}

#[tokio::test]
async fn sale_price_is_charged_and_snapshotted() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let product_id = seed_product(&state, 1999, Some(1499), 1, 20, 10).await?;
    let identity = user();

    cart_service::add_item(
        &state,
        &identity,
        AddToCartRequest {
            product_id,
            quantity: 2,
        },
    )
    .await?;
    let session = checkout_service::initiate(&state, &identity, shipping()).await?;
    let payment_id = session.data.unwrap().payment_id;
    let order = order_service::materialize(&state, payment_id).await?;

    assert_eq!(order.items[0].unit_price, 1499);
    assert_eq!(order.order.subtotal, 2998);

    // A later price change never reaches the placed order.
    sqlx::query("UPDATE products SET price = 9999, sale_price = NULL WHERE id = $1")
        .bind(product_id)
        .execute(&state.pool)
        .await?;
    let again = order_service::materialize(&state, payment_id).await?;
    assert_eq!(again.items[0].unit_price, 1499);
    Ok(())
}

#[tokio::test]
async fn admin_status_machine_and_inventory_flow() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let product_id = seed_product(&state, 1999, None, 1, 20, 10).await?;
    let identity = user();

    cart_service::add_item(
        &state,
        &identity,
        AddToCartRequest {
            product_id,
            quantity: 1,
        },
    )
    .await?;
    let session = checkout_service::initiate(&state, &identity, shipping()).await?;
    let order = order_service::materialize(&state, session.data.unwrap().payment_id).await?;

    let admin = AuthUser {
        user_id: Uuid::new_v4(),
        role: "admin".into(),
    };
    let customer = AuthUser {
        user_id: Uuid::new_v4(),
        role: "user".into(),
    };

    // Only admins may drive the logistics transitions.
    let err = order_service::update_status(
        &state,
        &customer,
        order.order.id,
        UpdateOrderStatusRequest {
            status: "shipped".into(),
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::Forbidden));

    // processing -> shipped -> delivered is the forward chain.
    let updated = order_service::update_status(
        &state,
        &admin,
        order.order.id,
        UpdateOrderStatusRequest {
            status: "shipped".into(),
        },
    )
    .await?;
    assert_eq!(updated.data.unwrap().status, "shipped");

    // Backward moves are refused.
    let err = order_service::update_status(
        &state,
        &admin,
        order.order.id,
        UpdateOrderStatusRequest {
            status: "processing".into(),
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));

    order_service::update_status(
        &state,
        &admin,
        order.order.id,
        UpdateOrderStatusRequest {
            status: "delivered".into(),
        },
    )
    .await?;

    // Delivered is terminal.
    let err = order_service::update_status(
        &state,
        &admin,
        order.order.id,
        UpdateOrderStatusRequest {
            status: "cancelled".into(),
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));

    // Inventory: materialization left 9 on hand; restock and over-draw.
    let restocked = admin_service::adjust_stock(
        &state,
        &admin,
        product_id,
        StockAdjustRequest { delta: 5 },
    )
    .await?;
    assert_eq!(restocked.data.unwrap().stock, 14);

    let err = admin_service::adjust_stock(
        &state,
        &admin,
        product_id,
        StockAdjustRequest { delta: -100 },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));
    Ok(())
}

#[tokio::test]
async fn decrease_floors_at_one_and_increase_respects_stock() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let product_id = seed_product(&state, 1999, None, 1, 20, 2).await?;
    let identity = user();

    let item = cart_service::add_item(
        &state,
        &identity,
        AddToCartRequest {
            product_id,
            quantity: 1,
        },
    )
    .await?
    .data
    .unwrap();

    let item_after = cart_service::decrease(&state, &identity, item.id).await?;
    assert_eq!(item_after.data.unwrap().quantity, 1);

    let item_after = cart_service::increase(&state, &identity, item.id).await?;
    assert_eq!(item_after.data.unwrap().quantity, 2);

    // Stock is exhausted; another bump is rejected.
    let err = cart_service::increase(&state, &identity, item.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::StockExceeded { available: 2 }));
    Ok(())
}
