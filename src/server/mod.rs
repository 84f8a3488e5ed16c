// HTTP surface — asset route, static files, CORS.

pub mod handler;
