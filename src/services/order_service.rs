use std::collections::HashMap;

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::ActiveValue::NotSet;
use sea_orm::sea_query::LockType;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
    QuerySelect, Set, TransactionTrait,
};
use uuid::Uuid;

use crate::{
    audit::log_audit,
    dto::orders::{OrderList, OrderWithItems, PlaceOrderRequest},
    entity::{
        cart_items::{Column as CartItemCol, Entity as CartItems},
        carts::{Column as CartCol, Entity as Carts},
        order_items::{
            ActiveModel as OrderItemActive, Column as OrderItemCol, Entity as OrderItems,
            Model as OrderItemModel,
        },
        orders::{ActiveModel as OrderActive, Column as OrderCol, Entity as Orders, Model as OrderModel},
        products::Entity as Products,
    },
    error::{AppError, AppResult},
    middleware::auth::AuthUser,
    models::{Order, OrderItem, OrderStatus},
    response::{ApiResponse, Meta},
    routes::params::Pagination,
    state::AppState,
};

struct LineSnapshot {
    product_id: Uuid,
    product_name: String,
    price: Decimal,
    quantity: i32,
}

/// Create the order with prices snapshotted from the catalog and empty the
/// caller's cart, all in one transaction. A failure anywhere leaves both
/// the order tables and the cart untouched.
pub async fn place_order(
    state: &AppState,
    user: &AuthUser,
    payload: PlaceOrderRequest,
) -> AppResult<ApiResponse<OrderWithItems>> {
    if payload.items.is_empty() {
        return Err(AppError::InvalidArgument(
            "order must contain at least one item".into(),
        ));
    }

    let txn = state.orm.begin().await?;

    let mut total = Decimal::ZERO;
    let mut snapshots: Vec<LineSnapshot> = Vec::with_capacity(payload.items.len());
    for item in &payload.items {
        let product = Products::find_by_id(item.product_id)
            .one(&txn)
            .await?
            .ok_or_else(|| AppError::not_found("product", item.product_id))?;

        // Quantity is taken verbatim; the unit price is frozen here and
        // never tracks later catalog changes.
        total += product.price * Decimal::from(item.quantity);
        snapshots.push(LineSnapshot {
            product_id: product.id,
            product_name: product.name,
            price: product.price,
            quantity: item.quantity,
        });
    }

    let order = OrderActive {
        id: Set(Uuid::new_v4()),
        user_id: Set(user.subject.clone()),
        total: Set(total),
        status: Set(OrderStatus::Placed),
        created_at: NotSet,
    }
    .insert(&txn)
    .await?;

    let mut items: Vec<OrderItemModel> = Vec::with_capacity(snapshots.len());
    for snapshot in snapshots {
        let item = OrderItemActive {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            product_id: Set(Some(snapshot.product_id)),
            product_name: Set(snapshot.product_name),
            quantity: Set(snapshot.quantity),
            price: Set(snapshot.price),
            created_at: NotSet,
        }
        .insert(&txn)
        .await?;
        items.push(item);
    }

    // Empty the cart in the same transaction as the order rows.
    if let Some(cart) = Carts::find()
        .filter(CartCol::UserId.eq(user.subject.as_str()))
        .one(&txn)
        .await?
    {
        CartItems::delete_many()
            .filter(CartItemCol::CartId.eq(cart.id))
            .exec(&txn)
            .await?;
    }

    txn.commit().await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(&user.subject),
        "order_placed",
        Some("orders"),
        Some(serde_json::json!({ "order_id": order.id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Order placed",
        OrderWithItems {
            order: order_from_entity(order),
            items: items.into_iter().map(order_item_from_entity).collect(),
        },
        Some(Meta::empty()),
    ))
}

pub async fn list_orders(
    state: &AppState,
    user: &AuthUser,
    pagination: Pagination,
) -> AppResult<ApiResponse<OrderList>> {
    let (page, limit, offset) = pagination.normalize();

    let finder = Orders::find()
        .filter(OrderCol::UserId.eq(user.subject.as_str()))
        .order_by_desc(OrderCol::CreatedAt);

    let total = finder.clone().count(&state.orm).await? as i64;

    let orders = finder
        .limit(limit as u64)
        .offset(offset as u64)
        .all(&state.orm)
        .await?;

    let order_ids: Vec<Uuid> = orders.iter().map(|o| o.id).collect();
    let mut lines_by_order: HashMap<Uuid, Vec<OrderItem>> = HashMap::new();
    if !order_ids.is_empty() {
        let lines = OrderItems::find()
            .filter(OrderItemCol::OrderId.is_in(order_ids))
            .all(&state.orm)
            .await?;
        for line in lines {
            lines_by_order
                .entry(line.order_id)
                .or_default()
                .push(order_item_from_entity(line));
        }
    }

    let items = orders
        .into_iter()
        .map(|order| {
            let lines = lines_by_order.remove(&order.id).unwrap_or_default();
            OrderWithItems {
                order: order_from_entity(order),
                items: lines,
            }
        })
        .collect();

    let meta = Meta::new(page, limit, total);
    Ok(ApiResponse::success("Orders", OrderList { items }, Some(meta)))
}

pub async fn get_order(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<OrderWithItems>> {
    let order = Orders::find_by_id(id)
        .one(&state.orm)
        .await?
        .ok_or_else(|| AppError::not_found("order", id))?;

    // The order exists; a different owner gets Forbidden, not NotFound.
    if order.user_id != user.subject {
        return Err(AppError::Forbidden);
    }

    let items = OrderItems::find()
        .filter(OrderItemCol::OrderId.eq(order.id))
        .all(&state.orm)
        .await?
        .into_iter()
        .map(order_item_from_entity)
        .collect();

    Ok(ApiResponse::success(
        "Order",
        OrderWithItems {
            order: order_from_entity(order),
            items,
        },
        Some(Meta::empty()),
    ))
}

pub async fn cancel_order(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<Order>> {
    let txn = state.orm.begin().await?;

    let order = Orders::find_by_id(id)
        .lock(LockType::Update)
        .one(&txn)
        .await?
        .ok_or_else(|| AppError::not_found("order", id))?;

    if order.user_id != user.subject {
        return Err(AppError::Forbidden);
    }

    // CANCELLED is terminal; cancelling twice is rejected, not ignored.
    if order.status != OrderStatus::Placed {
        return Err(AppError::InvalidArgument(format!(
            "only PLACED orders can be cancelled, current status is {}",
            order.status.as_str()
        )));
    }

    let mut active: OrderActive = order.into();
    active.status = Set(OrderStatus::Cancelled);
    let order = active.update(&txn).await?;

    txn.commit().await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(&user.subject),
        "order_cancelled",
        Some("orders"),
        Some(serde_json::json!({ "order_id": order.id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Order cancelled",
        order_from_entity(order),
        Some(Meta::empty()),
    ))
}

fn order_from_entity(model: OrderModel) -> Order {
    Order {
        id: model.id,
        user_id: model.user_id,
        total: model.total,
        status: model.status,
        created_at: model.created_at.with_timezone(&Utc),
    }
}

fn order_item_from_entity(model: OrderItemModel) -> OrderItem {
    OrderItem {
        id: model.id,
        order_id: model.order_id,
        product_id: model.product_id,
        product_name: model.product_name,
        quantity: model.quantity,
        price: model.price,
        created_at: model.created_at.with_timezone(&Utc),
    }
}
