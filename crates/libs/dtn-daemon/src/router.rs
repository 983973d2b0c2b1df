//! Static router (§4.7): an EID-pattern to next-hop-link table.

use dtn_core::EndpointId;

use crate::ids::LinkId;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RouteAction {
    /// Forward the bundle and let the link consume the local copy.
    Forward,
    /// Forward a copy, retaining the original for possible retransmission
    /// or multi-route delivery.
    ForwardAndKeepCopy,
}

#[derive(Clone, Debug)]
pub struct Route {
    pub pattern: EndpointId,
    pub link: LinkId,
    pub action: RouteAction,
}

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum RouterError {
    #[error("no route matching pattern {0} and link {1}")]
    NotFound(String, LinkId),
}

/// Static route table. Matching is insertion-order: the first route whose
/// pattern matches the destination wins, per §4.7.
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new() -> Self {
        Router { routes: Vec::new() }
    }

    pub fn add_route(&mut self, route: Route) {
        self.routes.push(route);
    }

    pub fn del_route(&mut self, pattern: &EndpointId, link: LinkId) -> Result<(), RouterError> {
        let before = self.routes.len();
        self.routes.retain(|r| !(r.pattern == *pattern && r.link == link));
        if self.routes.len() == before {
            return Err(RouterError::NotFound(pattern.to_string(), link));
        }
        Ok(())
    }

    /// Returns the first matching route for `destination`, if any. A bundle
    /// whose destination matches no route is held pending until a matching
    /// route is added, per §4.7's hold-until-route-exists behavior — callers
    /// are responsible for re-querying on route-table changes.
    pub fn lookup(&self, destination: &EndpointId) -> Option<&Route> {
        self.routes.iter().find(|r| r.pattern.matches(destination))
    }

    /// All routes matching `destination`, in table order.
    pub fn lookup_all(&self, destination: &EndpointId) -> Vec<&Route> {
        self.routes.iter().filter(|r| r.pattern.matches(destination)).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eid(s: &str) -> EndpointId {
        EndpointId::parse(s).unwrap()
    }

    #[test]
    fn insertion_order_wins_on_overlap() {
        let mut router = Router::new();
        router.add_route(Route { pattern: eid("dtn://*"), link: 1, action: RouteAction::Forward });
        router.add_route(Route {
            pattern: eid("dtn://x/*"),
            link: 2,
            action: RouteAction::Forward,
        });
        let hit = router.lookup(&eid("dtn://x/app")).unwrap();
        assert_eq!(hit.link, 1, "first inserted route should win even though the second is narrower");
    }

    #[test]
    fn no_match_returns_none() {
        let router = Router::new();
        assert!(router.lookup(&eid("dtn://x/app")).is_none());
    }

    #[test]
    fn del_route_removes_exact_entry() {
        let mut router = Router::new();
        router.add_route(Route { pattern: eid("dtn://x/*"), link: 1, action: RouteAction::Forward });
        router.del_route(&eid("dtn://x/*"), 1).unwrap();
        assert!(router.lookup(&eid("dtn://x/app")).is_none());
    }

    #[test]
    fn del_route_missing_is_error() {
        let mut router = Router::new();
        assert!(router.del_route(&eid("dtn://x/*"), 1).is_err());
    }

    #[test]
    fn lookup_all_returns_every_match_in_order() {
        let mut router = Router::new();
        router.add_route(Route { pattern: eid("dtn://*"), link: 1, action: RouteAction::Forward });
        router.add_route(Route {
            pattern: eid("dtn://x/*"),
            link: 2,
            action: RouteAction::ForwardAndKeepCopy,
        });
        let hits = router.lookup_all(&eid("dtn://x/app"));
        assert_eq!(hits.iter().map(|r| r.link).collect::<Vec<_>>(), vec![1, 2]);
    }
}
