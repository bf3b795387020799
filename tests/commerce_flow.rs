use rust_decimal::Decimal;
use storefront_api::{
    db::{create_orm_conn, create_pool},
    dto::cart::{AddToCartRequest, UpdateCartItemRequest},
    dto::orders::{OrderItemRequest, PlaceOrderRequest},
    dto::products::{CreateProductRequest, UpdateProductRequest},
    error::AppError,
    middleware::auth::AuthUser,
    models::{OrderStatus, Product},
    routes::params::{Pagination, ProductQuery},
    services::{cart_service, order_service, product_service},
    state::AppState,
};
use uuid::Uuid;

// DB-backed integration tests. Each test scopes its data to fresh subjects
// and uniquely named fixtures, so they can run in parallel against one
// database without cleaning up after each other.

async fn setup() -> Option<AppState> {
    let database_url = match std::env::var("TEST_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
    {
        Ok(url) => url,
        Err(_) => {
            eprintln!(
                "Skipping test: set TEST_DATABASE_URL or DATABASE_URL to run integration tests."
            );
            return None;
        }
    };

    let pool = create_pool(&database_url).await.expect("pool");
    let orm = create_orm_conn(&database_url).await.expect("orm");
    sqlx::migrate!("./migrations").run(&pool).await.expect("migrations");

    Some(AppState { pool, orm })
}

fn shopper() -> AuthUser {
    AuthUser {
        subject: format!("shopper-{}@example.com", Uuid::new_v4()),
        role: "user".into(),
    }
}

fn admin() -> AuthUser {
    AuthUser {
        subject: "admin@example.com".into(),
        role: "admin".into(),
    }
}

async fn seed_product(
    state: &AppState,
    price: Decimal,
    category: Option<&str>,
) -> Product {
    product_service::create_product(
        state,
        &admin(),
        CreateProductRequest {
            name: format!("Fixture Widget {}", Uuid::new_v4()),
            description: Some("integration fixture".into()),
            price,
            image_url: None,
            category: category.map(Into::into),
        },
    )
    .await
    .expect("create product")
    .data
    .expect("product payload")
}

async fn add(state: &AppState, user: &AuthUser, product_id: Uuid, quantity: i32) {
    cart_service::add_item(
        &state.pool,
        user,
        AddToCartRequest {
            product_id,
            quantity,
        },
    )
    .await
    .expect("add to cart");
}

#[tokio::test]
async fn adding_a_product_twice_merges_into_one_line() {
    let Some(state) = setup().await else { return };
    let user = shopper();
    let product = seed_product(&state, Decimal::new(1000, 2), None).await;

    add(&state, &user, product.id, 2).await;
    add(&state, &user, product.id, 3).await;

    let cart = cart_service::get_cart(&state.pool, &user)
        .await
        .expect("cart")
        .data
        .expect("cart payload");
    assert_eq!(cart.items.len(), 1, "merge must not duplicate the line");
    assert_eq!(cart.items[0].quantity, 5);
    assert_eq!(cart.total, Decimal::new(5000, 2));
}

#[tokio::test]
async fn non_positive_quantities_are_floored_to_one() {
    let Some(state) = setup().await else { return };
    let user = shopper();
    let zero_qty = seed_product(&state, Decimal::new(500, 2), None).await;
    let negative_qty = seed_product(&state, Decimal::new(500, 2), None).await;

    add(&state, &user, zero_qty.id, 0).await;
    add(&state, &user, negative_qty.id, -5).await;

    let cart = cart_service::get_cart(&state.pool, &user)
        .await
        .expect("cart")
        .data
        .expect("cart payload");
    assert_eq!(cart.items.len(), 2);
    assert!(cart.items.iter().all(|line| line.quantity == 1));
}

#[tokio::test]
async fn add_item_rejects_unknown_products() {
    let Some(state) = setup().await else { return };
    let user = shopper();

    let err = cart_service::add_item(
        &state.pool,
        &user,
        AddToCartRequest {
            product_id: Uuid::new_v4(),
            quantity: 1,
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::NotFound { .. }));
}

#[tokio::test]
async fn update_item_never_creates_a_line() {
    let Some(state) = setup().await else { return };
    let user = shopper();
    let product = seed_product(&state, Decimal::new(1000, 2), None).await;

    // Materialize the cart, then try to update a line that was never added.
    cart_service::get_cart(&state.pool, &user).await.expect("cart");
    let err = cart_service::update_item(
        &state.pool,
        &user,
        product.id,
        UpdateCartItemRequest { quantity: 3 },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::NotFound { .. }));

    let cart = cart_service::get_cart(&state.pool, &user)
        .await
        .expect("cart")
        .data
        .expect("cart payload");
    assert!(cart.items.is_empty(), "failed update must not create a line");

    add(&state, &user, product.id, 2).await;
    let cart = cart_service::update_item(
        &state.pool,
        &user,
        product.id,
        UpdateCartItemRequest { quantity: 7 },
    )
    .await
    .expect("update")
    .data
    .expect("cart payload");
    assert_eq!(cart.items[0].quantity, 7, "update sets, it does not merge");

    let cart = cart_service::update_item(
        &state.pool,
        &user,
        product.id,
        UpdateCartItemRequest { quantity: -3 },
    )
    .await
    .expect("update")
    .data
    .expect("cart payload");
    assert_eq!(cart.items[0].quantity, 1, "floor applies to updates too");
}

#[tokio::test]
async fn removing_a_line_is_idempotent() {
    let Some(state) = setup().await else { return };
    let user = shopper();
    let product = seed_product(&state, Decimal::new(1000, 2), None).await;

    add(&state, &user, product.id, 1).await;

    let cart = cart_service::remove_item(&state.pool, &user, product.id)
        .await
        .expect("first remove")
        .data
        .expect("cart payload");
    assert!(cart.items.is_empty());

    let cart = cart_service::remove_item(&state.pool, &user, product.id)
        .await
        .expect("second remove succeeds")
        .data
        .expect("cart payload");
    assert!(cart.items.is_empty());
}

#[tokio::test]
async fn placing_an_order_snapshots_prices_and_clears_the_cart() {
    let Some(state) = setup().await else { return };
    let user = shopper();
    let p1 = seed_product(&state, Decimal::new(1000, 2), None).await;
    let p2 = seed_product(&state, Decimal::new(500, 2), None).await;

    add(&state, &user, p1.id, 2).await;
    add(&state, &user, p2.id, 1).await;

    let placed = order_service::place_order(
        &state,
        &user,
        PlaceOrderRequest {
            items: vec![
                OrderItemRequest {
                    product_id: p1.id,
                    quantity: 2,
                },
                OrderItemRequest {
                    product_id: p2.id,
                    quantity: 1,
                },
            ],
        },
    )
    .await
    .expect("place order")
    .data
    .expect("order payload");

    assert_eq!(placed.order.total, Decimal::new(2500, 2));
    assert_eq!(placed.order.status, OrderStatus::Placed);
    assert_eq!(placed.items.len(), 2);

    let cart = cart_service::get_cart(&state.pool, &user)
        .await
        .expect("cart")
        .data
        .expect("cart payload");
    assert!(cart.items.is_empty(), "placement must empty the cart");

    // Reprice p1; the placed order must not move.
    product_service::update_product(
        &state,
        &admin(),
        p1.id,
        UpdateProductRequest {
            name: p1.name.clone(),
            description: p1.description.clone(),
            price: Decimal::new(9999, 2),
            image_url: None,
            category: None,
        },
    )
    .await
    .expect("reprice");

    let fetched = order_service::get_order(&state, &user, placed.order.id)
        .await
        .expect("get order")
        .data
        .expect("order payload");
    assert_eq!(fetched.order.total, Decimal::new(2500, 2));
    let line = fetched
        .items
        .iter()
        .find(|item| item.product_id == Some(p1.id))
        .expect("line for p1");
    assert_eq!(line.price, Decimal::new(1000, 2), "snapshot must hold");
}

#[tokio::test]
async fn empty_orders_are_rejected() {
    let Some(state) = setup().await else { return };
    let user = shopper();

    let err = order_service::place_order(&state, &user, PlaceOrderRequest { items: vec![] })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidArgument(_)));
}

#[tokio::test]
async fn failed_placement_leaves_the_cart_untouched() {
    let Some(state) = setup().await else { return };
    let user = shopper();
    let product = seed_product(&state, Decimal::new(1000, 2), None).await;

    add(&state, &user, product.id, 2).await;

    let err = order_service::place_order(
        &state,
        &user,
        PlaceOrderRequest {
            items: vec![
                OrderItemRequest {
                    product_id: product.id,
                    quantity: 1,
                },
                OrderItemRequest {
                    product_id: Uuid::new_v4(),
                    quantity: 1,
                },
            ],
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::NotFound { .. }));

    let cart = cart_service::get_cart(&state.pool, &user)
        .await
        .expect("cart")
        .data
        .expect("cart payload");
    assert_eq!(cart.items.len(), 1, "cart must survive the failed placement");
    assert_eq!(cart.items[0].quantity, 2);

    let orders = order_service::list_orders(
        &state,
        &user,
        Pagination {
            page: None,
            per_page: None,
        },
    )
    .await
    .expect("list orders")
    .data
    .expect("order list");
    assert!(orders.items.is_empty(), "no half-written order may exist");
}

#[tokio::test]
async fn cancellation_is_gated_by_status_and_ownership() {
    let Some(state) = setup().await else { return };
    let user = shopper();
    let stranger = shopper();
    let product = seed_product(&state, Decimal::new(1000, 2), None).await;

    let placed = order_service::place_order(
        &state,
        &user,
        PlaceOrderRequest {
            items: vec![OrderItemRequest {
                product_id: product.id,
                quantity: 1,
            }],
        },
    )
    .await
    .expect("place order")
    .data
    .expect("order payload");

    let cancelled = order_service::cancel_order(&state, &user, placed.order.id)
        .await
        .expect("cancel")
        .data
        .expect("order payload");
    assert_eq!(cancelled.status, OrderStatus::Cancelled);

    let err = order_service::cancel_order(&state, &user, placed.order.id)
        .await
        .unwrap_err();
    assert!(
        matches!(err, AppError::InvalidArgument(_)),
        "double cancel is rejected, not ignored"
    );

    let err = order_service::get_order(&state, &stranger, placed.order.id)
        .await
        .unwrap_err();
    assert!(
        matches!(err, AppError::Forbidden),
        "someone else's order is Forbidden, not NotFound"
    );

    let err = order_service::cancel_order(&state, &stranger, placed.order.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden));

    let err = order_service::get_order(&state, &user, Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound { .. }));
}

#[tokio::test]
async fn category_names_dedupe_case_insensitively() {
    let Some(state) = setup().await else { return };
    let category = format!("Books-{}", Uuid::new_v4());

    seed_product(&state, Decimal::new(1500, 2), Some(&category.to_uppercase())).await;
    seed_product(&state, Decimal::new(2000, 2), Some(&category.to_lowercase())).await;

    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM categories WHERE lower(name) = lower($1)")
            .bind(&category)
            .fetch_one(&state.pool)
            .await
            .expect("count");
    assert_eq!(count, 1, "one category row per case-insensitive name");
}

#[tokio::test]
async fn deleting_a_product_prunes_cart_lines_and_keeps_order_snapshots() {
    let Some(state) = setup().await else { return };
    let user = shopper();
    let product = seed_product(&state, Decimal::new(750, 2), None).await;

    let placed = order_service::place_order(
        &state,
        &user,
        PlaceOrderRequest {
            items: vec![OrderItemRequest {
                product_id: product.id,
                quantity: 2,
            }],
        },
    )
    .await
    .expect("place order")
    .data
    .expect("order payload");

    // Put the product back into the cart before deleting it.
    add(&state, &user, product.id, 1).await;

    product_service::delete_product(&state, &admin(), product.id)
        .await
        .expect("delete product");

    let cart = cart_service::get_cart(&state.pool, &user)
        .await
        .expect("cart")
        .data
        .expect("cart payload");
    assert!(cart.items.is_empty(), "cart lines go with the product");

    let fetched = order_service::get_order(&state, &user, placed.order.id)
        .await
        .expect("get order")
        .data
        .expect("order payload");
    assert_eq!(fetched.items.len(), 1);
    assert_eq!(fetched.items[0].product_name, product.name);
    assert_eq!(fetched.items[0].price, Decimal::new(750, 2));
    assert_eq!(fetched.items[0].product_id, None);
}

#[tokio::test]
async fn search_matches_name_and_category_case_insensitively() {
    let Some(state) = setup().await else { return };
    let category = format!("Gadgets-{}", Uuid::new_v4());
    let product = seed_product(&state, Decimal::new(1200, 2), Some(&category)).await;

    let query = ProductQuery {
        pagination: Pagination {
            page: None,
            per_page: None,
        },
        q: Some(product.name.to_uppercase()),
        category: Some(category.to_uppercase()),
        sort_by: None,
        sort_order: None,
    };
    let listed = product_service::list_products(&state, query)
        .await
        .expect("list")
        .data
        .expect("product list");
    assert!(
        listed.items.iter().any(|p| p.id == product.id),
        "case-insensitive search must find the product"
    );
    assert!(
        listed
            .items
            .iter()
            .all(|p| p.category.as_deref() == Some(category.as_str())),
        "category filter is an exact match"
    );
}
