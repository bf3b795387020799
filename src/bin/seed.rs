use rust_decimal::Decimal;
use storefront_api::{config::AppConfig, db::create_pool};
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env()?;

    let pool = create_pool(&config.database_url).await?;
    // Ensure migrations are applied.
    sqlx::migrate!("./migrations").run(&pool).await?;

    let demo = [
        (
            "The Rust Programming Language",
            "Hardcover, second edition",
            Decimal::new(3999, 2),
            "Books",
        ),
        (
            "Mechanical Keyboard",
            "Tenkeyless, hot-swappable switches",
            Decimal::new(12900, 2),
            "Electronics",
        ),
        (
            "USB-C Dock",
            "Dual display, 100W passthrough",
            Decimal::new(8450, 2),
            "Electronics",
        ),
        (
            "Pour-Over Kettle",
            "Gooseneck, 1 litre",
            Decimal::new(4500, 2),
            "Kitchen",
        ),
    ];

    for (name, description, price, category) in demo {
        let category_id = ensure_category(&pool, category).await?;
        ensure_product(&pool, name, description, price, category_id).await?;
    }

    println!("Seed completed");
    Ok(())
}

async fn ensure_category(pool: &sqlx::PgPool, name: &str) -> anyhow::Result<Uuid> {
    sqlx::query(
        "INSERT INTO categories (id, name) VALUES ($1, $2) ON CONFLICT (lower(name)) DO NOTHING",
    )
    .bind(Uuid::new_v4())
    .bind(name)
    .execute(pool)
    .await?;

    let (id,): (Uuid,) = sqlx::query_as("SELECT id FROM categories WHERE lower(name) = lower($1)")
        .bind(name)
        .fetch_one(pool)
        .await?;
    Ok(id)
}

async fn ensure_product(
    pool: &sqlx::PgPool,
    name: &str,
    description: &str,
    price: Decimal,
    category_id: Uuid,
) -> anyhow::Result<()> {
    let existing: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM products WHERE name = $1")
        .bind(name)
        .fetch_optional(pool)
        .await?;
    if existing.is_some() {
        return Ok(());
    }

    sqlx::query(
        r#"
        INSERT INTO products (id, name, description, price, category_id)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(name)
    .bind(description)
    .bind(price)
    .bind(category_id)
    .execute(pool)
    .await?;

    println!("Seeded product {name}");
    Ok(())
}
