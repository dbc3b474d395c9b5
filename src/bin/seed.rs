use sea_orm::ActiveValue::NotSet;
use sea_orm::{ActiveModelTrait, Set};
use uuid::Uuid;

use storefront_api::{
    config::AppConfig,
    db::{create_orm_conn, create_pool, run_migrations},
    entity::products::ActiveModel as ProductActive,
};

/// Seed a handful of products for local development.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env()?;
    let pool = create_pool(&config.database_url).await?;
    run_migrations(&pool).await?;
    let orm = create_orm_conn(&config.database_url).await?;

    let seed = [
        ("Jollof rice spice mix", 1999i64, None, 1, 20, 50),
        ("Dried hibiscus petals 500g", 1250, Some(999i64), 1, 10, 30),
        ("Palm oil 1L", 899, None, 1, 6, 24),
        ("Garri premium 2kg", 1499, None, 2, 12, 40),
    ];

    for (name, price, sale_price, min_purchase, max_purchase, stock) in seed {
        let product = ProductActive {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            description: Set(Some(format!("{name} - seeded for development"))),
            price: Set(price),
            sale_price: Set(sale_price),
            min_purchase: Set(min_purchase),
            max_purchase: Set(max_purchase),
            stock: Set(stock),
            available: Set(true),
            created_at: NotSet,
        }
        .insert(&orm)
        .await?;
        println!("seeded product {} ({})", product.name, product.id);
    }

    Ok(())
}
