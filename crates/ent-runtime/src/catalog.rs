use ent_schemas::Product;

/// Order products for display: most expensive first, ties by product id so
/// the list is stable across provider responses.
pub fn sort_catalog(mut products: Vec<Product>) -> Vec<Product> {
    products.sort_by(|a, b| {
        b.price_micros
            .cmp(&a.price_micros)
            .then_with(|| a.id.as_str().cmp(b.id.as_str()))
    });
    products
}
