use utoipa::{
    Modify, OpenApi,
    openapi::{
        self,
        OpenApi as OpenApiSpec,
        security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    },
};
use utoipa_scalar::{Scalar, Servable};

use crate::{
    dto::{
        cart::{AddToCartRequest, CartLine, CartSummary, CartView},
        checkout::{BuyNowRequest, CheckoutRequest, CheckoutSessionDto, ShippingDetails},
        orders::{OrderList, OrderWithItems, UpdateOrderStatusRequest},
        products::{CreateProductRequest, ProductList, StockAdjustRequest},
        webhook::WebhookAck,
    },
    models::{CartItem, Order, OrderItem, Product},
    response::{ApiResponse, Meta},
    routes::{admin, cart, checkout, health, orders, params, products, webhooks},
};

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health_check,
        products::list_products,
        products::get_product,
        cart::cart_list,
        cart::add_to_cart,
        cart::increase_quantity,
        cart::decrease_quantity,
        cart::remove_from_cart,
        checkout::create_session,
        checkout::buy_now,
        checkout::complete,
        webhooks::payment_webhook,
        orders::list_orders,
        orders::get_order,
        admin::update_order_status,
        admin::create_product,
        admin::adjust_stock,
        admin::list_low_stock
    ),
    components(
        schemas(
            Product,
            CartItem,
            Order,
            OrderItem,
            CartLine,
            CartSummary,
            CartView,
            AddToCartRequest,
            ShippingDetails,
            CheckoutRequest,
            BuyNowRequest,
            CheckoutSessionDto,
            OrderList,
            OrderWithItems,
            UpdateOrderStatusRequest,
            CreateProductRequest,
            StockAdjustRequest,
            ProductList,
            WebhookAck,
            params::Pagination,
            params::OrderListQuery,
            params::LowStockQuery,
            Meta,
            ApiResponse<Product>,
            ApiResponse<CartView>,
            ApiResponse<CheckoutSessionDto>,
            ApiResponse<OrderList>,
            ApiResponse<OrderWithItems>,
            ApiResponse<WebhookAck>
        )
    ),
    security(
        ("bearer_auth" = [])
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Health", description = "Health check endpoint"),
        (name = "Products", description = "Product catalog, read-only surface"),
        (name = "Cart", description = "Cart mutation endpoints"),
        (name = "Checkout", description = "Checkout session and completion endpoints"),
        (name = "Webhooks", description = "Inbound payment gateway events"),
        (name = "Orders", description = "Order history"),
        (name = "Admin", description = "Admin endpoints"),
    )
)]
pub struct ApiDoc;

pub fn scalar_docs() -> Scalar<OpenApiSpec> {
    Scalar::with_url("/docs", ApiDoc::openapi())
}
