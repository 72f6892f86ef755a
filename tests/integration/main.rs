mod crawl;
mod price_tracking;
mod proxy_pool;
