pub mod cert_store;
pub mod header_template;
pub mod http_redirect;
pub mod https_proxy;
pub mod oauth_routes;
pub mod router;
pub mod upstream_table;
