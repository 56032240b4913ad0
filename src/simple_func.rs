// Simple parameterized functions of read length.
//
// Several knobs (minimum score, N ceiling, seed interval, walk budgets)
// are functions of the read length rather than constants. They are
// configured from strings like "L,-0.6,-0.6" or "S,1,1.25" where the
// first token picks the shape and the remaining two are the constant and
// the coefficient.

/// Function shape applied to the length argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuncKind {
    Const,
    Linear,
    Sqrt,
    Log,
}

/// `f(x) = clamp(constant + coefficient * g(x))` where `g` depends on the
/// kind: identity for Linear, sqrt for Sqrt, natural log for Log, and 1
/// for Const.
#[derive(Debug, Clone, Copy)]
pub struct SimpleFunc {
    pub kind: FuncKind,
    pub constant: f64,
    pub coefficient: f64,
    pub min_val: f64,
    pub max_val: f64,
}

impl SimpleFunc {
    pub fn new(kind: FuncKind, constant: f64, coefficient: f64) -> Self {
        SimpleFunc {
            kind,
            constant,
            coefficient,
            min_val: f64::MIN,
            max_val: f64::MAX,
        }
    }

    /// Constant function, ignores its argument.
    pub fn constant(value: f64) -> Self {
        SimpleFunc::new(FuncKind::Const, value, 0.0)
    }

    pub fn linear(constant: f64, coefficient: f64) -> Self {
        SimpleFunc::new(FuncKind::Linear, constant, coefficient)
    }

    pub fn with_min(mut self, min_val: f64) -> Self {
        self.min_val = min_val;
        self
    }

    /// Scale the constant and coefficient in place. Used to halve the
    /// walk budgets for paired extension.
    pub fn mult(&mut self, factor: f64) {
        self.constant *= factor;
        self.coefficient *= factor;
    }

    pub fn eval(&self, x: f64) -> f64 {
        let g = match self.kind {
            FuncKind::Const => 1.0,
            FuncKind::Linear => x,
            FuncKind::Sqrt => x.sqrt(),
            FuncKind::Log => x.ln(),
        };
        let v = self.constant + self.coefficient * g;
        v.clamp(self.min_val, self.max_val)
    }

    /// Evaluate and round to the nearest integer.
    pub fn eval_i64(&self, x: f64) -> i64 {
        self.eval(x).round() as i64
    }

    /// Parse a function string of the form "K,constant,coefficient" where
    /// K is C (constant), L (linear), S (sqrt) or G (log).
    pub fn parse(s: &str) -> Result<Self, String> {
        let parts: Vec<&str> = s.split(',').collect();
        if parts.len() != 3 {
            return Err(format!("Function must be K,CONST,COEF: {}", s));
        }
        let kind = match parts[0].trim() {
            "C" => FuncKind::Const,
            "L" => FuncKind::Linear,
            "S" => FuncKind::Sqrt,
            "G" => FuncKind::Log,
            other => return Err(format!("Unknown function type '{}' in: {}", other, s)),
        };
        let constant = parts[1]
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("Invalid function constant: {}", parts[1]))?;
        let coefficient = parts[2]
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("Invalid function coefficient: {}", parts[2]))?;
        Ok(SimpleFunc::new(kind, constant, coefficient))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_linear() {
        let f = SimpleFunc::parse("L,0,-0.6").unwrap();
        assert_eq!(f.kind, FuncKind::Linear);
        assert!((f.eval(8.0) - (-4.8)).abs() < 1e-9);
    }

    #[test]
    fn test_parse_sqrt_interval() {
        // The default seed interval: 1 + 1.25 * sqrt(len)
        let f = SimpleFunc::parse("S,1,1.25").unwrap();
        assert_eq!(f.kind, FuncKind::Sqrt);
        assert_eq!(f.eval_i64(100.0), 14); // 1 + 12.5, rounded
    }

    #[test]
    fn test_parse_errors() {
        assert!(SimpleFunc::parse("L,0").is_err());
        assert!(SimpleFunc::parse("X,0,1").is_err());
        assert!(SimpleFunc::parse("L,zero,1").is_err());
    }

    #[test]
    fn test_clamping() {
        let f = SimpleFunc::linear(0.0, 1.0).with_min(1.0);
        assert_eq!(f.eval(0.25), 1.0);
        assert_eq!(f.eval(5.0), 5.0);
    }

    #[test]
    fn test_mult_halves_budget() {
        let mut f = SimpleFunc::linear(2.0, 4.0);
        f.mult(0.5);
        assert_eq!(f.eval(1.0), 3.0);
    }
}
