/// Exchange routing type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Route to queues bound with exactly the message's routing key.
    Direct,
    /// Route to every bound queue.
    Fanout,
}

impl ExchangeKind {
    /// Kind name as AMQP spells it.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    routing_key: String,
}

/// A declared exchange and its bindings.
#[derive(Debug)]
pub(crate) struct Exchange {
    kind: ExchangeKind,
    bindings: Vec<Binding>,
}

impl Exchange {
    pub(crate) fn new(kind: ExchangeKind) -> Self {
        Self {
            kind,
            bindings: Vec::new(),
        }
    }

    pub(crate) fn kind(&self) -> ExchangeKind {
        self.kind
    }

    /// Add a binding; binding the same pair twice is a no-op.
    pub(crate) fn bind(&mut self, queue: &str, routing_key: &str) {
        let binding = Binding {
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !self.bindings.contains(&binding) {
            self.bindings.push(binding);
        }
    }

    /// Drop every binding to `queue`.
    pub(crate) fn unbind_queue(&mut self, queue: &str) {
        self.bindings.retain(|b| b.queue != queue);
    }

    /// Queues a message with `routing_key` goes to, each at most once.
    pub(crate) fn route(&self, routing_key: &str) -> Vec<String> {
        let mut targets: Vec<String> = Vec::new();
        for binding in &self.bindings {
            let matches = match self.kind {
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Fanout => true,
            };
            if matches && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }
        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_routes_by_exact_key() {
        let mut exchange = Exchange::new(ExchangeKind::Direct);
        exchange.bind("orders", "order.created");
        exchange.bind("audit", "");

        assert_eq!(exchange.route("order.created"), vec!["orders"]);
        assert_eq!(exchange.route(""), vec!["audit"]);
        assert!(exchange.route("order.deleted").is_empty());
    }

    #[test]
    fn test_fanout_ignores_key() {
        let mut exchange = Exchange::new(ExchangeKind::Fanout);
        exchange.bind("a", "x");
        exchange.bind("b", "y");

        assert_eq!(exchange.route("anything"), vec!["a", "b"]);
    }

    #[test]
    fn test_queue_routed_once_per_message() {
        let mut exchange = Exchange::new(ExchangeKind::Fanout);
        exchange.bind("a", "x");
        exchange.bind("a", "y");
        exchange.bind("a", "x");

        assert_eq!(exchange.route("x"), vec!["a"]);
    }

    #[test]
    fn test_unbind_queue() {
        let mut exchange = Exchange::new(ExchangeKind::Direct);
        exchange.bind("a", "");
        exchange.bind("b", "");
        exchange.unbind_queue("a");

        assert_eq!(exchange.route(""), vec!["b"]);
    }
}
