use super::{NotificationKind, ReceiptContext};
use crate::models::payment_intent::format_usd;
use std::fmt::Write;

#[derive(Debug, Clone, PartialEq)]
pub struct EmailMessage {
    pub subject: String,
    pub text: String,
    pub html: String,
}

/// Renders customer emails as plain text plus a minimal HTML alternative.
#[derive(Debug, Clone)]
pub struct EmailComposer {
    store_name: String,
}

impl Default for EmailComposer {
    fn default() -> Self {
        Self::new("Our Store")
    }
}

impl EmailComposer {
    pub fn new(store_name: impl Into<String>) -> Self {
        Self {
            store_name: store_name.into(),
        }
    }

    pub fn compose(&self, kind: NotificationKind, ctx: &ReceiptContext) -> EmailMessage {
        let subject = match kind {
            NotificationKind::Success => {
                format!("{}: order {} confirmed", self.store_name, ctx.reference())
            }
            NotificationKind::Failure => {
                format!("{}: payment for order {} failed", self.store_name, ctx.reference())
            }
            NotificationKind::TrackingUpdate => {
                format!("{}: order {} has shipped", self.store_name, ctx.reference())
            }
        };

        let sections = self.sections(kind, ctx);
        let text = sections
            .iter()
            .map(|(heading, lines)| render_text(heading.as_deref(), lines))
            .collect::<Vec<_>>()
            .join("\n");
        let mut html = String::from("<html><body style=\"font-family:sans-serif\">");
        for (heading, lines) in &sections {
            html.push_str(&render_html(heading.as_deref(), lines));
        }
        if let (Some(map_url), NotificationKind::Success | NotificationKind::TrackingUpdate) =
            (&ctx.map_url, kind)
        {
            let _ = write!(
                html,
                "<p><img src=\"{}\" alt=\"Delivery location\" width=\"600\"></p>",
                escape_html(map_url)
            );
        }
        html.push_str("</body></html>");

        EmailMessage { subject, text, html }
    }

    fn sections(&self, kind: NotificationKind, ctx: &ReceiptContext) -> Vec<(Option<String>, Vec<String>)> {
        let greeting = match &ctx.customer_name {
            Some(name) => format!("Hi {},", name),
            None => "Hi,".to_string(),
        };

        let mut sections = Vec::new();
        let intro = match kind {
            NotificationKind::Success => vec![
                greeting,
                format!(
                    "Thanks for your order. We received your payment of ${} {} and your order is being prepared.",
                    format_usd(ctx.amount_charged),
                    ctx.currency
                ),
            ],
            NotificationKind::Failure => {
                let mut lines = vec![
                    greeting,
                    "We could not process the payment for your order. You have not been charged.".to_string(),
                ];
                if let Some(reason) = &ctx.failure_reason {
                    lines.push(format!("Reason: {}", reason));
                }
                lines.push("You can try again with a different payment method.".to_string());
                lines
            }
            NotificationKind::TrackingUpdate => vec![
                greeting,
                "Good news: your order is on its way.".to_string(),
            ],
        };
        sections.push((None, intro));

        if let Some(tracking) = &ctx.tracking_number {
            sections.push((
                Some("Tracking".to_string()),
                vec![format!("Tracking number: {}", tracking)],
            ));
        }

        if kind != NotificationKind::Failure {
            if !ctx.items.is_empty() {
                let lines = ctx
                    .items
                    .iter()
                    .map(|i| format!("{} x {}", i.quantity, i.title))
                    .collect();
                sections.push((Some("Items".to_string()), lines));
            }

            if let Some(totals) = &ctx.totals {
                sections.push((
                    Some("Summary".to_string()),
                    vec![
                        format!("Subtotal: ${}", format_usd(totals.subtotal)),
                        format!("Tax: ${}", format_usd(totals.tax)),
                        format!("Processing fee: ${}", format_usd(totals.fee)),
                        format!("Total: ${}", format_usd(ctx.amount_charged)),
                    ],
                ));
            }

            if let Some(card) = &ctx.card {
                let line = match (&card.brand, &card.last4) {
                    (Some(brand), Some(last4)) => format!("{} ending in {}", brand.to_uppercase(), last4),
                    (None, Some(last4)) => format!("Card ending in {}", last4),
                    (Some(brand), None) => brand.to_uppercase(),
                    (None, None) => String::new(),
                };
                if !line.is_empty() {
                    sections.push((Some("Payment".to_string()), vec![line]));
                }
            }

            if let Some(address) = &ctx.shipping {
                let mut lines = Vec::new();
                if !address.name.is_empty() {
                    lines.push(address.name.clone());
                }
                lines.push(address.one_line());
                sections.push((Some("Shipping to".to_string()), lines));
            }
        }

        sections.push((None, vec![format!("{} team", self.store_name)]));
        sections
    }
}

fn render_text(heading: Option<&str>, lines: &[String]) -> String {
    let mut out = String::new();
    if let Some(heading) = heading {
        let _ = writeln!(out, "{}", heading);
    }
    for line in lines {
        let _ = writeln!(out, "{}", line);
    }
    out
}

fn render_html(heading: Option<&str>, lines: &[String]) -> String {
    let mut out = String::new();
    if let Some(heading) = heading {
        let _ = write!(out, "<h3>{}</h3>", escape_html(heading));
    }
    let _ = write!(
        out,
        "<p>{}</p>",
        lines
            .iter()
            .map(|l| escape_html(l))
            .collect::<Vec<_>>()
            .join("<br>")
    );
    out
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
