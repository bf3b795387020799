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
        cart::{AddToCartRequest, UpdateCartItemRequest},
        orders::{OrderItemRequest, OrderList, OrderWithItems, PlaceOrderRequest},
        products::{CreateProductRequest, ProductList, UpdateProductRequest},
    },
    models::{Cart, CartLine, Order, OrderItem, OrderStatus, Product},
    response::{ApiResponse, Meta},
    routes::{cart, health, orders, params, products},
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
        products::create_product,
        products::update_product,
        products::delete_product,
        cart::get_cart,
        cart::add_item,
        cart::update_item,
        cart::remove_item,
        orders::place_order,
        orders::list_orders,
        orders::get_order,
        orders::cancel_order
    ),
    components(
        schemas(
            Product,
            Cart,
            CartLine,
            Order,
            OrderItem,
            OrderStatus,
            CreateProductRequest,
            UpdateProductRequest,
            ProductList,
            AddToCartRequest,
            UpdateCartItemRequest,
            PlaceOrderRequest,
            OrderItemRequest,
            OrderWithItems,
            OrderList,
            params::Pagination,
            params::ProductQuery,
            Meta,
            ApiResponse<Product>,
            ApiResponse<ProductList>,
            ApiResponse<Cart>,
            ApiResponse<OrderWithItems>,
            ApiResponse<OrderList>
        )
    ),
    security(
        ("bearer_auth" = [])
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Health", description = "Health check endpoint"),
        (name = "Products", description = "Catalog browsing and admin product management"),
        (name = "Cart", description = "Per-user cart with live pricing"),
        (name = "Orders", description = "Order placement and lifecycle"),
    )
)]
pub struct ApiDoc;

pub fn scalar_docs() -> Scalar<OpenApiSpec> {
    Scalar::with_url("/docs", ApiDoc::openapi())
}
