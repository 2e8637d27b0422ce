//! 多步配准参数串.
//!
//! 格式为以 `:` 分隔的若干步骤, 每步由 `,` 分隔的 `key=value` 组成, 例如
//! `step=1,type=seg,algo=columnwise,metric=MeanSquares,smooth=5,iter=1:step=2,type=im,iter=4`.
//! 后一步在前一步的结果之上继续细化.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// 解析配准参数串错误.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ParseRecipeError {
    /// 参数串为空.
    #[error("配准参数串为空")]
    Empty,

    /// 某一项不是 `key=value` 形式.
    #[error("配准参数项 `{0}` 不是 key=value 形式")]
    MalformedPair(String),

    /// 某个数值字段无法解析.
    #[error("配准参数 `{key}` 的取值 `{value}` 非法")]
    InvalidValue {
        /// 字段名.
        key: String,
        /// 原始取值.
        value: String,
    },

    /// 某一步缺少 `step` 字段.
    #[error("第 {0} 个配准步骤缺少 step 编号")]
    MissingStep(usize),

    /// 步骤编号不是从 1 开始连续递增.
    #[error("配准步骤编号应为 {expected}, 但发现了 {got}")]
    StepOutOfOrder {
        /// 期望的编号.
        expected: u32,
        /// 实际编号.
        got: u32,
    },
}

/// 单步配准的输入类型.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum StepKind {
    /// 以分割掩码为输入.
    Seg,

    /// 以强度图像为输入.
    #[default]
    Im,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::Seg => f.write_str("seg"),
            StepKind::Im => f.write_str("im"),
        }
    }
}

/// 单个配准步骤.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegStep {
    /// 步骤编号, 从 1 开始.
    pub step: u32,

    /// 输入类型.
    pub kind: StepKind,

    /// 变换算法名 (如 `syn`, `columnwise`, `translation`).
    pub algo: String,

    /// 相似性度量名 (如 `MeanSquares`, `MI`, `CC`).
    pub metric: String,

    /// 平滑核大小, 单位为像素.
    pub smooth: f64,

    /// 迭代次数. 0 表示跳过该步.
    pub iter: u32,

    /// 下采样因子.
    pub shrink: u32,

    /// 未识别的字段, 原样保留并回写给外部程序.
    pub extra: BTreeMap<String, String>,
}

impl RegStep {
    /// 以缺省值创建第 `step` 步.
    pub fn new(step: u32) -> Self {
        Self {
            step,
            kind: StepKind::Im,
            algo: "syn".to_string(),
            metric: "MeanSquares".to_string(),
            smooth: 0.0,
            iter: 10,
            shrink: 1,
            extra: BTreeMap::new(),
        }
    }

    /// 该步是否会被执行.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.iter > 0
    }
}

impl fmt::Display for RegStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "step={},type={},algo={},metric={},iter={},smooth={},shrink={}",
            self.step, self.kind, self.algo, self.metric, self.iter, self.smooth, self.shrink
        )?;
        for (k, v) in self.extra.iter() {
            write!(f, ",{k}={v}")?;
        }
        Ok(())
    }
}

/// 有序的多步配准参数.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegistrationRecipe {
    steps: Vec<RegStep>,
}

impl RegistrationRecipe {
    /// 所有步骤.
    #[inline]
    pub fn steps(&self) -> &[RegStep] {
        &self.steps
    }

    /// 会被实际执行的步骤.
    #[inline]
    pub fn active_steps(&self) -> impl Iterator<Item = &RegStep> {
        self.steps.iter().filter(|s| s.is_active())
    }

    /// 所有步骤迭代次数之和.
    #[inline]
    pub fn total_iterations(&self) -> u32 {
        self.steps.iter().map(|s| s.iter).sum()
    }
}

fn parse_num<T: FromStr>(key: &str, value: &str) -> Result<T, ParseRecipeError> {
    value.parse().map_err(|_| ParseRecipeError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_step(index: usize, text: &str) -> Result<RegStep, ParseRecipeError> {
    let mut pairs = Vec::new();
    for item in text.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (k, v) = item
            .split_once('=')
            .ok_or_else(|| ParseRecipeError::MalformedPair(item.to_string()))?;
        pairs.push((k.trim(), v.trim()));
    }

    let step_no = pairs
        .iter()
        .find(|(k, _)| *k == "step")
        .ok_or(ParseRecipeError::MissingStep(index + 1))?;
    let mut step = RegStep::new(parse_num("step", step_no.1)?);

    for (key, value) in pairs {
        match key {
            "step" => {}
            "type" => {
                step.kind = match value {
                    "seg" => StepKind::Seg,
                    "im" => StepKind::Im,
                    _ => {
                        return Err(ParseRecipeError::InvalidValue {
                            key: key.to_string(),
                            value: value.to_string(),
                        })
                    }
                }
            }
            "algo" => step.algo = value.to_string(),
            "metric" => step.metric = value.to_string(),
            "smooth" => step.smooth = parse_num(key, value)?,
            "iter" => step.iter = parse_num(key, value)?,
            "shrink" => step.shrink = parse_num(key, value)?,
            _ => {
                step.extra.insert(key.to_string(), value.to_string());
            }
        }
    }
    Ok(step)
}

impl FromStr for RegistrationRecipe {
    type Err = ParseRecipeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let steps = s
            .split(':')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .enumerate()
            .map(|(i, t)| parse_step(i, t))
            .collect::<Result<Vec<_>, _>>()?;
        if steps.is_empty() {
            return Err(ParseRecipeError::Empty);
        }
        for (i, st) in steps.iter().enumerate() {
            let expected = i as u32 + 1;
            if st.step != expected {
                return Err(ParseRecipeError::StepOutOfOrder {
                    expected,
                    got: st.step,
                });
            }
        }
        Ok(Self { steps })
    }
}

impl fmt::Display for RegistrationRecipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, s) in self.steps.iter().enumerate() {
            if i != 0 {
                f.write_str(":")?;
            }
            write!(f, "{s}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::DEFAULT_REGISTER_PARAM;

    #[test]
    fn test_parse_default() {
        let r: RegistrationRecipe = DEFAULT_REGISTER_PARAM.parse().unwrap();
        assert_eq!(r.steps().len(), 3);

        let s1 = &r.steps()[0];
        assert_eq!(s1.kind, StepKind::Seg);
        assert_eq!(s1.algo, "columnwise");
        assert_eq!(s1.metric, "MeanSquares");
        assert_eq!(s1.smooth, 5.0);
        assert_eq!(s1.iter, 1);

        let s2 = &r.steps()[1];
        assert_eq!(s2.kind, StepKind::Im);
        assert_eq!(s2.metric, "MI");
        assert_eq!(s2.iter, 4);

        // 第三步只有 iter=0, 其余取缺省值, 并且不会被执行.
        let s3 = &r.steps()[2];
        assert_eq!(s3.algo, "syn");
        assert!(!s3.is_active());
        assert_eq!(r.active_steps().count(), 2);
        assert_eq!(r.total_iterations(), 5);
    }

    #[test]
    fn test_display_reparses() {
        let r: RegistrationRecipe = "step=1,type=seg,iter=2,gradStep=0.5:step=2,iter=0"
            .parse()
            .unwrap();
        assert_eq!(r.steps()[0].extra.get("gradStep").unwrap(), "0.5");
        let again: RegistrationRecipe = r.to_string().parse().unwrap();
        assert_eq!(again, r);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            "".parse::<RegistrationRecipe>().unwrap_err(),
            ParseRecipeError::Empty
        );
        assert_eq!(
            "step=1,iter".parse::<RegistrationRecipe>().unwrap_err(),
            ParseRecipeError::MalformedPair("iter".into())
        );
        assert_eq!(
            "type=im,iter=2".parse::<RegistrationRecipe>().unwrap_err(),
            ParseRecipeError::MissingStep(1)
        );
        assert_eq!(
            "step=1:step=3".parse::<RegistrationRecipe>().unwrap_err(),
            ParseRecipeError::StepOutOfOrder {
                expected: 2,
                got: 3
            }
        );
        assert!("step=1,iter=many".parse::<RegistrationRecipe>().is_err());
        assert!("step=1,type=mesh".parse::<RegistrationRecipe>().is_err());
    }
}
