use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::sea_query::extension::postgres::PgExpr;
use sea_orm::sea_query::{Expr, Func};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, EntityTrait, FromQueryResult,
    JoinType, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, RelationTrait, Select, Set,
    SqlErr, TransactionTrait,
};
use sea_orm::ActiveValue::NotSet;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

use crate::{
    audit::log_audit,
    dto::products::{CreateProductRequest, ProductList, UpdateProductRequest},
    entity::{
        cart_items::{Column as CartItemCol, Entity as CartItems},
        categories::{
            ActiveModel as CategoryActive, Column as CategoryCol, Entity as Categories,
            Model as CategoryModel,
        },
        products::{
            self, ActiveModel as ProductActive, Column as ProductCol, Entity as Products,
            Model as ProductModel,
        },
    },
    error::{AppError, AppResult},
    middleware::auth::{AuthUser, ensure_admin},
    models::Product,
    response::{ApiResponse, Meta},
    routes::params::{ProductQuery, ProductSortBy, SortOrder},
    state::AppState,
};

#[derive(Debug, FromQueryResult)]
struct ProductRow {
    id: Uuid,
    name: String,
    description: Option<String>,
    price: Decimal,
    image_url: Option<String>,
    category: Option<String>,
    created_at: DateTimeWithTimeZone,
}

// Products joined to their category so responses carry the category name.
fn product_finder() -> Select<Products> {
    Products::find()
        .select_only()
        .column(ProductCol::Id)
        .column(ProductCol::Name)
        .column(ProductCol::Description)
        .column(ProductCol::Price)
        .column(ProductCol::ImageUrl)
        .column(ProductCol::CreatedAt)
        .column_as(CategoryCol::Name, "category")
        .join(JoinType::LeftJoin, products::Relation::Categories.def())
}

pub async fn list_products(
    state: &AppState,
    query: ProductQuery,
) -> AppResult<ApiResponse<ProductList>> {
    let (page, limit, offset) = query.pagination.normalize();
    let mut condition = Condition::all();

    if let Some(q) = query.q.as_ref().filter(|s| !s.is_empty()) {
        let pattern = format!("%{q}%");
        condition = condition.add(Expr::col((Products, ProductCol::Name)).ilike(pattern));
    }

    if let Some(category) = query.category.as_ref().filter(|s| !s.is_empty()) {
        condition = condition.add(
            Expr::expr(Func::lower(Expr::col((Categories, CategoryCol::Name))))
                .eq(category.to_lowercase()),
        );
    }

    let sort_by = query.sort_by.unwrap_or(ProductSortBy::CreatedAt);
    let sort_order = query.sort_order.unwrap_or(SortOrder::Desc);
    let sort_col = match sort_by {
        ProductSortBy::CreatedAt => ProductCol::CreatedAt,
        ProductSortBy::Price => ProductCol::Price,
        ProductSortBy::Name => ProductCol::Name,
    };

    let mut finder = product_finder().filter(condition);
    finder = match sort_order {
        SortOrder::Asc => finder.order_by_asc(sort_col),
        SortOrder::Desc => finder.order_by_desc(sort_col),
    };

    let total = finder.clone().count(&state.orm).await? as i64;

    let items = finder
        .limit(limit as u64)
        .offset(offset as u64)
        .into_model::<ProductRow>()
        .all(&state.orm)
        .await?
        .into_iter()
        .map(product_from_row)
        .collect();

    let meta = Meta::new(page, limit, total);
    Ok(ApiResponse::success("Products", ProductList { items }, Some(meta)))
}

pub async fn get_product(state: &AppState, id: Uuid) -> AppResult<ApiResponse<Product>> {
    let row = product_finder()
        .filter(ProductCol::Id.eq(id))
        .into_model::<ProductRow>()
        .one(&state.orm)
        .await?;
    let product = match row {
        Some(row) => product_from_row(row),
        None => return Err(AppError::not_found("product", id)),
    };
    Ok(ApiResponse::success("Product", product, None))
}

pub async fn create_product(
    state: &AppState,
    user: &AuthUser,
    payload: CreateProductRequest,
) -> AppResult<ApiResponse<Product>> {
    ensure_admin(user)?;
    validate_fields(&payload.name, payload.price)?;

    let category = resolve_category(&state.orm, payload.category.as_deref()).await?;
    let active = ProductActive {
        id: Set(Uuid::new_v4()),
        name: Set(payload.name.trim().to_string()),
        description: Set(payload.description),
        price: Set(payload.price),
        image_url: Set(payload.image_url),
        category_id: Set(category.as_ref().map(|c| c.id)),
        created_at: NotSet,
    };
    let product = active.insert(&state.orm).await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(&user.subject),
        "product_create",
        Some("products"),
        Some(serde_json::json!({ "product_id": product.id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Product created",
        product_from_entity(product, category.map(|c| c.name)),
        Some(Meta::empty()),
    ))
}

pub async fn update_product(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
    payload: UpdateProductRequest,
) -> AppResult<ApiResponse<Product>> {
    ensure_admin(user)?;
    validate_fields(&payload.name, payload.price)?;

    let existing = Products::find_by_id(id)
        .one(&state.orm)
        .await?
        .ok_or_else(|| AppError::not_found("product", id))?;

    let category = resolve_category(&state.orm, payload.category.as_deref()).await?;

    // Full replace of the mutable fields, category included.
    let mut active: ProductActive = existing.into();
    active.name = Set(payload.name.trim().to_string());
    active.description = Set(payload.description);
    active.price = Set(payload.price);
    active.image_url = Set(payload.image_url);
    active.category_id = Set(category.as_ref().map(|c| c.id));

    let product = active.update(&state.orm).await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(&user.subject),
        "product_update",
        Some("products"),
        Some(serde_json::json!({ "product_id": product.id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Updated",
        product_from_entity(product, category.map(|c| c.name)),
        Some(Meta::empty()),
    ))
}

pub async fn delete_product(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<serde_json::Value>> {
    ensure_admin(user)?;

    // Cart lines pointing at the product go with it; order lines are
    // self-contained snapshots and stay.
    let txn = state.orm.begin().await?;

    CartItems::delete_many()
        .filter(CartItemCol::ProductId.eq(id))
        .exec(&txn)
        .await?;

    let result = Products::delete_by_id(id).exec(&txn).await?;
    if result.rows_affected == 0 {
        return Err(AppError::not_found("product", id));
    }

    txn.commit().await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(&user.subject),
        "product_delete",
        Some("products"),
        Some(serde_json::json!({ "product_id": id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Deleted",
        serde_json::json!({}),
        Some(Meta::empty()),
    ))
}

/// Look up a category by case-insensitive name, inserting it on a miss.
/// Races on the lower(name) unique index are resolved by re-fetching; the
/// conflict never reaches the caller.
pub async fn get_or_create_category<C: ConnectionTrait>(
    conn: &C,
    name: &str,
) -> AppResult<CategoryModel> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::InvalidArgument(
            "category name must not be blank".into(),
        ));
    }

    if let Some(existing) = find_category_by_name(conn, name).await? {
        return Ok(existing);
    }

    let active = CategoryActive {
        id: Set(Uuid::new_v4()),
        name: Set(name.to_string()),
        created_at: NotSet,
    };
    match Categories::insert(active).exec_without_returning(conn).await {
        Ok(_) => {}
        // Lost the upsert race; the row exists now.
        Err(err) if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {}
        Err(err) => return Err(err.into()),
    }

    find_category_by_name(conn, name)
        .await?
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("category upsert lost its row")))
}

async fn find_category_by_name<C: ConnectionTrait>(
    conn: &C,
    name: &str,
) -> AppResult<Option<CategoryModel>> {
    let found = Categories::find()
        .filter(
            Expr::expr(Func::lower(Expr::col((Categories, CategoryCol::Name))))
                .eq(name.to_lowercase()),
        )
        .one(conn)
        .await?;
    Ok(found)
}

async fn resolve_category<C: ConnectionTrait>(
    conn: &C,
    name: Option<&str>,
) -> AppResult<Option<CategoryModel>> {
    match name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => Ok(Some(get_or_create_category(conn, name).await?)),
        None => Ok(None),
    }
}

fn validate_fields(name: &str, price: Decimal) -> AppResult<()> {
    if name.trim().is_empty() {
        return Err(AppError::InvalidArgument(
            "product name must not be blank".into(),
        ));
    }
    if price <= Decimal::ZERO {
        return Err(AppError::InvalidArgument("price must be positive".into()));
    }
    Ok(())
}

fn product_from_row(row: ProductRow) -> Product {
    Product {
        id: row.id,
        name: row.name,
        description: row.description,
        price: row.price,
        image_url: row.image_url,
        category: row.category,
        created_at: row.created_at.with_timezone(&Utc),
    }
}

fn product_from_entity(model: ProductModel, category: Option<String>) -> Product {
    Product {
        id: model.id,
        name: model.name,
        description: model.description,
        price: model.price,
        image_url: model.image_url,
        category,
        created_at: model.created_at.with_timezone(&Utc),
    }
}
