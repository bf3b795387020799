use rust_decimal::Decimal;
use sqlx::FromRow;
use uuid::Uuid;

use crate::{
    audit::log_audit,
    db::DbPool,
    dto::cart::{AddToCartRequest, UpdateCartItemRequest},
    error::{AppError, AppResult},
    middleware::auth::AuthUser,
    models::{Cart, CartLine},
    response::ApiResponse,
};

#[derive(FromRow)]
struct CartLineRow {
    product_id: Uuid,
    name: String,
    category: Option<String>,
    price: Decimal,
    quantity: i32,
}

/// Fetch-or-create the subject's cart row. The unique constraint on
/// carts.user_id resolves concurrent first accesses; whoever loses the
/// insert race picks up the winner's row on the select.
async fn ensure_cart(pool: &DbPool, subject: &str) -> AppResult<Uuid> {
    sqlx::query("INSERT INTO carts (id, user_id) VALUES ($1, $2) ON CONFLICT (user_id) DO NOTHING")
        .bind(Uuid::new_v4())
        .bind(subject)
        .execute(pool)
        .await?;

    let (cart_id,): (Uuid,) = sqlx::query_as("SELECT id FROM carts WHERE user_id = $1")
        .bind(subject)
        .fetch_one(pool)
        .await?;
    Ok(cart_id)
}

/// Cart totals are derived from live catalog prices on every read; only
/// orders snapshot prices.
async fn load_cart(pool: &DbPool, cart_id: Uuid) -> AppResult<Cart> {
    let rows = sqlx::query_as::<_, CartLineRow>(
        r#"
        SELECT ci.product_id, p.name, c.name AS category, p.price, ci.quantity
        FROM cart_items ci
        JOIN products p ON p.id = ci.product_id
        LEFT JOIN categories c ON c.id = p.category_id
        WHERE ci.cart_id = $1
        ORDER BY ci.created_at
        "#,
    )
    .bind(cart_id)
    .fetch_all(pool)
    .await?;

    let items: Vec<CartLine> = rows
        .into_iter()
        .map(|row| {
            let line_total = row.price * Decimal::from(row.quantity);
            CartLine {
                product_id: row.product_id,
                name: row.name,
                category: row.category,
                price: row.price,
                quantity: row.quantity,
                line_total,
            }
        })
        .collect();
    let total = items.iter().map(|line| line.line_total).sum();

    Ok(Cart {
        id: cart_id,
        items,
        total,
    })
}

pub async fn get_cart(pool: &DbPool, user: &AuthUser) -> AppResult<ApiResponse<Cart>> {
    let cart_id = ensure_cart(pool, &user.subject).await?;
    let cart = load_cart(pool, cart_id).await?;
    Ok(ApiResponse::success("Cart", cart, None))
}

pub async fn add_item(
    pool: &DbPool,
    user: &AuthUser,
    payload: AddToCartRequest,
) -> AppResult<ApiResponse<Cart>> {
    // Non-positive quantities are floored to 1, never rejected.
    let quantity = payload.quantity.max(1);

    let product: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM products WHERE id = $1")
        .bind(payload.product_id)
        .fetch_optional(pool)
        .await?;
    if product.is_none() {
        return Err(AppError::not_found("product", payload.product_id));
    }

    let cart_id = ensure_cart(pool, &user.subject).await?;

    // One line per (cart, product): an existing line has its quantity
    // incremented rather than a second line appended.
    sqlx::query(
        r#"
        INSERT INTO cart_items (id, cart_id, product_id, quantity)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (cart_id, product_id)
        DO UPDATE SET quantity = cart_items.quantity + EXCLUDED.quantity
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(cart_id)
    .bind(payload.product_id)
    .bind(quantity)
    .execute(pool)
    .await?;

    if let Err(err) = log_audit(
        pool,
        Some(&user.subject),
        "cart_add",
        Some("cart_items"),
        Some(serde_json::json!({ "product_id": payload.product_id, "quantity": quantity })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    let cart = load_cart(pool, cart_id).await?;
    Ok(ApiResponse::success("Item added", cart, None))
}

pub async fn update_item(
    pool: &DbPool,
    user: &AuthUser,
    product_id: Uuid,
    payload: UpdateCartItemRequest,
) -> AppResult<ApiResponse<Cart>> {
    let quantity = payload.quantity.max(1);

    let cart: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM carts WHERE user_id = $1")
        .bind(&user.subject)
        .fetch_optional(pool)
        .await?;
    let cart_id = match cart {
        Some((id,)) => id,
        None => return Err(AppError::not_found("cart", &user.subject)),
    };

    // Update only adjusts an existing line; it never creates one.
    let result = sqlx::query(
        "UPDATE cart_items SET quantity = $3 WHERE cart_id = $1 AND product_id = $2",
    )
    .bind(cart_id)
    .bind(product_id)
    .bind(quantity)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::not_found("cart item", product_id));
    }

    if let Err(err) = log_audit(
        pool,
        Some(&user.subject),
        "cart_update",
        Some("cart_items"),
        Some(serde_json::json!({ "product_id": product_id, "quantity": quantity })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    let cart = load_cart(pool, cart_id).await?;
    Ok(ApiResponse::success("Item updated", cart, None))
}

pub async fn remove_item(
    pool: &DbPool,
    user: &AuthUser,
    product_id: Uuid,
) -> AppResult<ApiResponse<Cart>> {
    let cart_id = ensure_cart(pool, &user.subject).await?;

    // Removing a line that is not there is a no-op, not an error.
    sqlx::query("DELETE FROM cart_items WHERE cart_id = $1 AND product_id = $2")
        .bind(cart_id)
        .bind(product_id)
        .execute(pool)
        .await?;

    if let Err(err) = log_audit(
        pool,
        Some(&user.subject),
        "cart_remove",
        Some("cart_items"),
        Some(serde_json::json!({ "product_id": product_id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    let cart = load_cart(pool, cart_id).await?;
    Ok(ApiResponse::success("Item removed", cart, None))
}
