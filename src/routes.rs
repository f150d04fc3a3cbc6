//! The router's hostname -> backend table
//!
//! Only the router owns a `RouteTable`. Mutation happens through the control
//! channel; the HTTP side only reads.

use crate::protocol::{Route, RouteSet};
use dashmap::DashMap;
use std::sync::Arc;

pub type SharedRouteTable = Arc<RouteTable>;

#[derive(Debug, Default)]
pub struct RouteTable {
    routes: DashMap<String, Route>,
}

fn key(host: &str) -> String {
    host.to_ascii_lowercase()
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedRouteTable {
        Arc::new(Self::new())
    }

    /// Insert or replace the route for its hostname, returning the previous one
    pub fn add_route(&self, route: Route) -> Option<Route> {
        self.routes.insert(key(&route.host_name), route)
    }

    pub fn add_routes(&self, routes: &RouteSet) {
        for route in routes.values() {
            self.add_route(route.clone());
        }
    }

    /// Remove routes by hostname, returning the ones that were present
    pub fn remove_routes(&self, routes: &RouteSet) -> Vec<Route> {
        routes
            .keys()
            .filter_map(|host| self.routes.remove(&key(host)).map(|(_, r)| r))
            .collect()
    }

    pub fn lookup(&self, host: &str) -> Option<Route> {
        self.routes.get(&key(host)).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Copy of all routes, sorted by hostname
    pub fn snapshot(&self) -> Vec<Route> {
        let mut routes: Vec<Route> = self.routes.iter().map(|r| r.value().clone()).collect();
        routes.sort_by(|a, b| a.host_name.cmp(&b.host_name));
        routes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{route_set, Color};

    fn route(process: &str, host: &str, port: u16, color: Color) -> Route {
        Route {
            process_name: process.to_string(),
            host_name: host.to_string(),
            port,
            color,
        }
    }

    #[test]
    fn test_add_same_route_twice_keeps_last_write() {
        let table = RouteTable::new();

        assert!(table
            .add_route(route("web", "app.test", 4000, Color::Red))
            .is_none());
        let previous = table.add_route(route("web2", "app.test", 5000, Color::Blue));

        assert_eq!(previous.unwrap().port, 4000);
        assert_eq!(table.len(), 1);

        let current = table.lookup("app.test").unwrap();
        assert_eq!(current.port, 5000);
        assert_eq!(current.process_name, "web2");
        assert_eq!(current.color, Color::Blue);
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let table = RouteTable::new();
        table.add_route(route("web", "App.Test", 4000, Color::Red));

        assert!(table.lookup("app.test").is_some());
        assert!(table.lookup("APP.TEST").is_some());
        assert!(table.lookup("other.test").is_none());
    }

    #[test]
    fn test_add_and_remove_routes() {
        let table = RouteTable::new();
        let routes = route_set([
            route("web", "app.test", 4000, Color::Red),
            route("api", "api.test", 4001, Color::Green),
        ]);

        table.add_routes(&routes);
        assert_eq!(table.len(), 2);

        let removed = table.remove_routes(&route_set([route("web", "app.test", 4000, Color::Red)]));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].process_name, "web");
        assert!(table.lookup("app.test").is_none());
        assert!(table.lookup("api.test").is_some());
    }

    #[test]
    fn test_remove_unknown_route_is_noop() {
        let table = RouteTable::new();
        let removed = table.remove_routes(&route_set([route("web", "app.test", 4000, Color::Red)]));
        assert!(removed.is_empty());
        assert!(table.is_empty());
    }

    #[test]
    fn test_snapshot_sorted() {
        let table = RouteTable::new();
        table.add_route(route("b", "b.test", 2, Color::Red));
        table.add_route(route("a", "a.test", 1, Color::Red));

        let hosts: Vec<String> = table.snapshot().into_iter().map(|r| r.host_name).collect();
        assert_eq!(hosts, vec!["a.test", "b.test"]);
    }
}
